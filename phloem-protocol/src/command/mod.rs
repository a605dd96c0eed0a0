//! Command parsing and key extraction
//!
//! A [`Command`] owns an encoded request (`*N\r\n$len\r\n...`) as an
//! immutable [`Bytes`] buffer and records where every argument and key sits
//! inside it. Framing is checked strictly: declared lengths must match the
//! actual bytes and nothing may follow the last argument.

mod format;
mod table;

pub use format::{encode_args, format_command};
pub use table::{all_commands, lookup, Arity, CommandDef, CommandKind, KeyRule};

use crate::slot::key_hash_slot;
use bytes::Bytes;
use std::iter::StepBy;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Command parse error: {0}")]
    Malformed(&'static str),
    #[error("Unknown command {0}")]
    UnknownCommand(String),
    #[error("Wrong number of arguments for command {0}")]
    WrongArity(&'static str),
    #[error("Failed to find keys of command {0}")]
    MissingKeys(&'static str),
    #[error("Invalid format string: {0}")]
    Format(String),
    #[error("Out of memory")]
    OutOfMemory,
}

/// Location of one key inside the command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPosition {
    /// Byte offset of the key's first byte
    pub offset: usize,
    /// Key length in bytes
    pub len: usize,
    /// Index of the argument holding the key (the verb is argument 0)
    pub arg: usize,
}

impl KeyPosition {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    buf: Bytes,
    args: Vec<Range<usize>>,
    keys: Vec<KeyPosition>,
    slot: Option<u16>,
}

impl Command {
    /// Parse an encoded command and extract its keys
    ///
    /// ```
    /// use phloem_protocol::Command;
    ///
    /// let cmd = Command::parse(&b"*3\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n"[..]).unwrap();
    /// assert_eq!(cmd.key(0), b"a");
    /// ```
    pub fn parse(buf: impl Into<Bytes>) -> Result<Self, ParseError> {
        let buf = buf.into();
        let args = parse_frame(&buf)?;
        let verb = &buf[args[0].clone()];
        let def = lookup(verb)
            .ok_or_else(|| ParseError::UnknownCommand(String::from_utf8_lossy(verb).into_owned()))?;
        let key_args = key_arguments(&buf, &args, def)?;

        let mut keys = Vec::new();
        keys.try_reserve(key_args.len()).map_err(|_| ParseError::OutOfMemory)?;
        keys.extend(key_args.map(|arg| KeyPosition {
            offset: args[arg].start,
            len: args[arg].len(),
            arg,
        }));

        let slot = common_slot(&buf, &keys);
        Ok(Self { kind: def.kind, buf, args, keys, slot })
    }

    /// Encode `args` and parse the result
    pub fn from_args<I, A>(args: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self::parse(encode_args(args))
    }

    /// Wrap an already encoded command without looking for keys
    ///
    /// Used for commands addressed to an explicit node, where routing does
    /// not need the key list. Only the framing is checked.
    pub fn unrouted(buf: impl Into<Bytes>) -> Result<Self, ParseError> {
        let buf = buf.into();
        let args = parse_frame(&buf)?;
        Ok(Self { kind: CommandKind::Unknown, buf, args, keys: Vec::new(), slot: None })
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The encoded command
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Cheap clone of the encoded command
    pub fn bytes(&self) -> Bytes {
        self.buf.clone()
    }

    /// Number of arguments including the verb
    pub fn narg(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|r| &self.buf[r.clone()])
    }

    pub fn keys(&self) -> &[KeyPosition] {
        &self.keys
    }

    /// Bytes of the `index`th key; panics if out of range
    pub fn key(&self, index: usize) -> &[u8] {
        &self.buf[self.keys[index].range()]
    }

    /// The argument right after the `index`th key, e.g. its MSET value
    pub fn value(&self, index: usize) -> Option<&[u8]> {
        self.arg(self.keys.get(index)?.arg + 1)
    }

    pub fn key_bytes(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.keys.iter().map(move |k| &self.buf[k.range()])
    }

    /// Slot shared by every key, or `None` if there are no keys or they
    /// hash to different slots
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    /// True when the keys hash to more than one slot
    pub fn is_cross_slot(&self) -> bool {
        self.slot.is_none() && !self.keys.is_empty()
    }
}

fn common_slot(buf: &[u8], keys: &[KeyPosition]) -> Option<u16> {
    let mut slots = keys.iter().map(|k| key_hash_slot(&buf[k.range()]));
    let first = slots.next()?;
    slots.all(|s| s == first).then_some(first)
}

enum State {
    ArgCount,
    ArgLength,
    ArgBody(usize),
    Done,
}

/// Split a multi-bulk request into argument ranges
fn parse_frame(buf: &[u8]) -> Result<Vec<Range<usize>>, ParseError> {
    let mut state = State::ArgCount;
    let mut pos = 0;
    let mut remaining = 0;
    let mut args: Vec<Range<usize>> = Vec::new();

    loop {
        state = match state {
            State::ArgCount => {
                expect_byte(buf, pos, b'*')?;
                let (count, next) = read_decimal(buf, pos + 1)?;
                if count == 0 {
                    return Err(ParseError::Malformed("empty command"));
                }
                // every argument takes at least 6 bytes, so a larger count cannot be honest
                if count > buf.len() / 6 {
                    return Err(ParseError::Malformed("argument count exceeds command length"));
                }
                args.try_reserve(count).map_err(|_| ParseError::OutOfMemory)?;
                remaining = count;
                pos = next;
                State::ArgLength
            }
            State::ArgLength if remaining == 0 => State::Done,
            State::ArgLength => {
                expect_byte(buf, pos, b'$')?;
                let (len, next) = read_decimal(buf, pos + 1)?;
                pos = next;
                State::ArgBody(len)
            }
            State::ArgBody(len) => {
                let end = pos
                    .checked_add(len)
                    .filter(|&end| end <= buf.len().saturating_sub(2))
                    .ok_or(ParseError::Malformed("argument length exceeds command length"))?;
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(ParseError::Malformed("argument not terminated by CRLF"));
                }
                args.push(pos..end);
                pos = end + 2;
                remaining -= 1;
                State::ArgLength
            }
            State::Done => {
                if pos != buf.len() {
                    return Err(ParseError::Malformed("trailing bytes after last argument"));
                }
                return Ok(args);
            }
        };
    }
}

fn expect_byte(buf: &[u8], pos: usize, want: u8) -> Result<(), ParseError> {
    match buf.get(pos) {
        Some(&b) if b == want => Ok(()),
        Some(_) if want == b'*' => Err(ParseError::Malformed("command is not a multi-bulk array")),
        Some(_) => Err(ParseError::Malformed("argument is not a bulk string")),
        None => Err(ParseError::Malformed("unexpected end of command")),
    }
}

/// Read `digits CRLF` starting at `pos`
fn read_decimal(buf: &[u8], mut pos: usize) -> Result<(usize, usize), ParseError> {
    let start = pos;
    let mut value: usize = 0;
    while let Some(&b) = buf.get(pos) {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(ParseError::Malformed("length overflow"))?;
        pos += 1;
    }
    if pos == start {
        return Err(ParseError::Malformed("missing length"));
    }
    if buf.get(pos..pos + 2) != Some(&b"\r\n"[..]) {
        return Err(ParseError::Malformed("length not terminated by CRLF"));
    }
    Ok((value, pos + 2))
}

/// Indices of the arguments that are keys, per the command's key rule
fn key_arguments(
    buf: &[u8],
    args: &[Range<usize>],
    def: &CommandDef,
) -> Result<StepBy<Range<usize>>, ParseError> {
    let narg = args.len();
    let mut step = 1;
    let name = def.name;
    let keys = match def.rule {
        KeyRule::None => 0..0,
        KeyRule::Single(Arity::Exact(n)) => {
            if narg != n + 2 {
                return Err(ParseError::WrongArity(name));
            }
            1..2
        }
        KeyRule::Single(Arity::AtLeast(n)) => {
            if narg < n + 2 {
                return Err(ParseError::WrongArity(name));
            }
            1..2
        }
        KeyRule::Vector => {
            if narg < 2 {
                return Err(ParseError::WrongArity(name));
            }
            1..narg
        }
        KeyRule::KeyValuePairs => {
            if narg < 3 || (narg - 1) % 2 != 0 {
                return Err(ParseError::WrongArity(name));
            }
            step = 2;
            1..narg
        }
        KeyRule::SubcommandKey => {
            if narg < 3 {
                return Err(ParseError::MissingKeys(name));
            }
            2..3
        }
        KeyRule::Eval => {
            if narg < 3 {
                return Err(ParseError::WrongArity(name));
            }
            let numkeys = std::str::from_utf8(&buf[args[2].clone()])
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or(ParseError::MissingKeys(name))?;
            if numkeys == 0 {
                return Err(ParseError::MissingKeys(name));
            }
            if numkeys > narg - 3 {
                return Err(ParseError::WrongArity(name));
            }
            3..3 + numkeys
        }
        KeyRule::StreamsKeyword { skip } => {
            let keyword = (1 + skip..narg)
                .find(|&i| buf[args[i].clone()].eq_ignore_ascii_case(b"STREAMS"))
                .ok_or(ParseError::MissingKeys(name))?;
            let rest = narg - keyword - 1;
            if rest == 0 || rest % 2 != 0 {
                return Err(ParseError::WrongArity(name));
            }
            keyword + 1..keyword + 1 + rest / 2
        }
    };
    Ok(keys.step_by(step))
}
