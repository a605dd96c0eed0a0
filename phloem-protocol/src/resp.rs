//! RESP reply codec
//!
//! Decodes RESP2 replies (status, error, integer, bulk, array) plus the RESP3
//! types a node may send once a connection has switched protocols (null,
//! boolean, double, big number, verbatim string, map, set, push). Sets and
//! pushes decode to [`Reply::Array`], verbatim strings to [`Reply::Bulk`] with
//! the format prefix removed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Nesting limit for aggregate replies
pub const MAX_DEPTH: usize = 64;

/// A decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
    Boolean(bool),
    Double(f64),
    Map(Vec<(Reply, Reply)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RespError {
    #[error("invalid reply type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
    #[error("reply nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

impl Reply {
    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn bulk(data: impl AsRef<[u8]>) -> Self {
        Reply::Bulk(Bytes::copy_from_slice(data.as_ref()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Error text without the leading `-`
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Raw bytes of a bulk or status reply
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            Reply::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// UTF-8 view of a bulk or status reply
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Nil => "nil",
            Reply::Array(_) => "array",
            Reply::Boolean(_) => "boolean",
            Reply::Double(_) => "double",
            Reply::Map(_) => "map",
        }
    }

    /// Append the RESP2 encoding of this reply to `out`
    ///
    /// Booleans encode as integers, doubles as bulk strings and maps as flat
    /// arrays, which is what a RESP2 server would send for the same data.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                out.put_u8(b'+');
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                out.put_u8(b'-');
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Integer(n) => put_header(out, b':', *n),
            Reply::Bulk(b) => {
                put_header(out, b'$', b.len() as i64);
                out.put_slice(b);
                out.put_slice(b"\r\n");
            }
            Reply::Nil => out.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                put_header(out, b'*', items.len() as i64);
                for item in items {
                    item.encode(out);
                }
            }
            Reply::Boolean(b) => put_header(out, b':', i64::from(*b)),
            Reply::Double(d) => Reply::bulk(d.to_string()).encode(out),
            Reply::Map(pairs) => {
                put_header(out, b'*', (pairs.len() * 2) as i64);
                for (k, v) in pairs {
                    k.encode(out);
                    v.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{s}"),
            Reply::Error(s) => write!(f, "(error) {s}"),
            Reply::Integer(n) => write!(f, "(integer) {n}"),
            Reply::Bulk(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {item}", i + 1)?;
                }
                Ok(())
            }
            Reply::Boolean(b) => write!(f, "({b})"),
            Reply::Double(d) => write!(f, "(double) {d}"),
            Reply::Map(pairs) => {
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}# {k} => {v}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

fn put_header(out: &mut BytesMut, prefix: u8, n: i64) {
    out.put_u8(prefix);
    out.put_slice(n.to_string().as_bytes());
    out.put_slice(b"\r\n");
}

/// Decode one reply from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete reply, or the
/// reply together with the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(Reply, usize)>, RespError> {
    decode_at(buf, 0, 0)
}

/// Decode one reply and consume its bytes from `buf`
///
/// Each call starts over from the front of `buf`. Streams that receive
/// replies in many reads should use a [`ReplyDecoder`].
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Reply>, RespError> {
    match decode(buf)? {
        Some((reply, used)) => {
            buf.advance(used);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Incremental decoder for a stream of replies
///
/// Keeps the framing progress of the reply at the front of the buffer
/// between reads, so a large reply arriving in many pieces is scanned once
/// and decoded once it is complete.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    /// Bytes at the front of the buffer that form complete elements
    scanned: usize,
    /// Elements still expected by each open aggregate, innermost last
    open: Vec<u64>,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next reply and consume its bytes from `buf`
    ///
    /// `buf` must only be modified by appending between calls.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>, RespError> {
        let len = match self.frame(buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        self.reset();
        match decode(&buf[..len])? {
            Some((reply, used)) => {
                buf.advance(used);
                Ok(Some(reply))
            }
            None => Err(RespError::Malformed("reply shorter than its framing")),
        }
    }

    fn reset(&mut self) {
        self.scanned = 0;
        self.open.clear();
    }

    /// Length of the reply at the front of `buf`, once all of it is there
    fn frame(&mut self, buf: &[u8]) -> Result<Option<usize>, RespError> {
        loop {
            let Some((children, next)) = scan_element(buf, self.scanned)? else {
                return Ok(None);
            };
            self.scanned = next;
            if children > 0 {
                if self.open.len() > MAX_DEPTH {
                    return Err(RespError::TooDeep);
                }
                self.open.push(children);
                continue;
            }
            // a finished element may complete every aggregate around it
            loop {
                match self.open.last_mut() {
                    None => return Ok(Some(self.scanned)),
                    Some(left) if *left > 1 => {
                        *left -= 1;
                        break;
                    }
                    Some(_) => {
                        self.open.pop();
                    }
                }
            }
        }
    }
}

/// Frame one element at `pos`: the number of child elements that follow it
/// and the offset just past its own bytes
fn scan_element(buf: &[u8], pos: usize) -> Result<Option<(u64, usize)>, RespError> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };
    match kind {
        b'+' | b'-' | b':' | b'(' | b'_' | b'#' | b',' => Ok(Some((0, next))),
        b'$' | b'=' | b'!' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((0, next)));
            }
            Ok(read_body(buf, next, len as usize)?.map(|(_, end)| (0, end)))
        }
        b'*' | b'~' | b'>' => Ok(Some((parse_int(line)?.max(0) as u64, next))),
        b'%' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Err(RespError::Malformed("negative map length"));
            }
            Ok(Some(((count as u64).saturating_mul(2), next)))
        }
        other => Err(RespError::UnknownType(other)),
    }
}

fn decode_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Reply, usize)>, RespError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    if depth > MAX_DEPTH {
        return Err(RespError::TooDeep);
    }
    let kind = buf[pos];
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    let decoded = match kind {
        b'+' => (Reply::Status(lossy(line)), next),
        b'-' => (Reply::Error(lossy(line)), next),
        b':' => (Reply::Integer(parse_int(line)?), next),
        b'(' => (Reply::Status(lossy(line)), next),
        b'_' => (Reply::Nil, next),
        b'#' => match line {
            b"t" => (Reply::Boolean(true), next),
            b"f" => (Reply::Boolean(false), next),
            _ => return Err(RespError::Malformed("boolean must be t or f")),
        },
        b',' => {
            let text = std::str::from_utf8(line)
                .map_err(|_| RespError::Malformed("double is not UTF-8"))?;
            let value = text.parse::<f64>().map_err(|_| RespError::Malformed("invalid double"))?;
            (Reply::Double(value), next)
        }
        b'$' | b'=' | b'!' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let Some((body, end)) = read_body(buf, next, len as usize)? else {
                return Ok(None);
            };
            let reply = match kind {
                b'!' => Reply::Error(lossy(body)),
                // verbatim strings carry a 3 byte format and ':' before the payload
                b'=' if body.len() >= 4 && body[3] == b':' => Reply::bulk(&body[4..]),
                _ => Reply::bulk(body),
            };
            (reply, end)
        }
        b'*' | b'~' | b'>' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match decode_at(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            (Reply::Array(items), cursor)
        }
        b'%' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Err(RespError::Malformed("negative map length"));
            }
            let mut pairs = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                let Some((key, after_key)) = decode_at(buf, cursor, depth + 1)? else {
                    return Ok(None);
                };
                let Some((value, after_value)) = decode_at(buf, after_key, depth + 1)? else {
                    return Ok(None);
                };
                pairs.push((key, value));
                cursor = after_value;
            }
            (Reply::Map(pairs), cursor)
        }
        other => return Err(RespError::UnknownType(other)),
    };
    Ok(Some(decoded))
}

/// Read up to CRLF starting at `start`; returns the line and the index after CRLF
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let Some(rest) = buf.get(start..) else {
        return Ok(None);
    };
    let Some(cr) = memchr::memchr(b'\r', rest) else {
        return Ok(None);
    };
    match rest.get(cr + 1) {
        None => Ok(None),
        Some(b'\n') => Ok(Some((&rest[..cr], start + cr + 2))),
        Some(_) => Err(RespError::Malformed("CR not followed by LF")),
    }
}

fn read_body(buf: &[u8], start: usize, len: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let end = start.checked_add(len).ok_or(RespError::Malformed("length overflow"))?;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(RespError::Malformed("bulk payload not terminated by CRLF"));
    }
    Ok(Some((&buf[start..end], end + 2)))
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(RespError::Malformed("invalid integer"))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
