//! Building encoded commands from argument lists or format strings

use super::ParseError;
use bytes::{BufMut, Bytes, BytesMut};

/// Encode arguments as a multi-bulk request
///
/// ```
/// use phloem_protocol::encode_args;
///
/// assert_eq!(&encode_args(["GET", "foo"])[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
/// ```
pub fn encode_args<I, A>(args: I) -> Bytes
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let args: Vec<A> = args.into_iter().collect();
    let payload: usize = args.iter().map(|a| a.as_ref().len() + 16).sum();
    let mut out = BytesMut::with_capacity(payload + 16);
    put_len(&mut out, b'*', args.len());
    for arg in &args {
        let arg = arg.as_ref();
        put_len(&mut out, b'$', arg.len());
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
    out.freeze()
}

fn put_len(out: &mut BytesMut, prefix: u8, len: usize) {
    out.put_u8(prefix);
    out.put_slice(len.to_string().as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode a whitespace separated format string
///
/// `%s` and `%b` are replaced by the next entry of `args` (both are binary
/// safe and may appear inside a larger token, as in `user:%s`), `%%` is a
/// literal percent sign. An argument produced only by a placeholder is kept
/// even when empty.
///
/// ```
/// use phloem_protocol::format_command;
///
/// let cmd = format_command("SET user:%s %b", &[b"42", b"v a l"]).unwrap();
/// assert_eq!(&cmd[..], b"*3\r\n$3\r\nSET\r\n$7\r\nuser:42\r\n$5\r\nv a l\r\n");
/// ```
pub fn format_command(fmt: &str, args: &[&[u8]]) -> Result<Bytes, ParseError> {
    let mut tokens: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    let mut touched = false;
    let mut next_arg = args.iter();
    let mut chars = fmt.bytes().peekable();

    while let Some(c) = chars.next() {
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                if touched {
                    tokens.push(std::mem::take(&mut current));
                    touched = false;
                }
            }
            b'%' => {
                match chars.next() {
                    Some(b's') | Some(b'b') => {
                        let arg = next_arg.next().ok_or_else(|| {
                            ParseError::Format(format!("not enough arguments for {fmt:?}"))
                        })?;
                        current.extend_from_slice(arg);
                    }
                    Some(b'%') => current.push(b'%'),
                    Some(other) => {
                        return Err(ParseError::Format(format!(
                            "unsupported conversion %{}",
                            other as char
                        )))
                    }
                    None => return Err(ParseError::Format("dangling %".to_string())),
                }
                touched = true;
            }
            other => {
                current.push(other);
                touched = true;
            }
        }
    }
    if touched {
        tokens.push(current);
    }
    if next_arg.next().is_some() {
        return Err(ParseError::Format(format!("too many arguments for {fmt:?}")));
    }
    if tokens.is_empty() {
        return Err(ParseError::Format("empty command".to_string()));
    }
    Ok(encode_args(tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_binary_args() {
        let args: [&[u8]; 3] = [b"SET", b"k\r\n", b""];
        let cmd = encode_args(args);
        assert_eq!(&cmd[..], b"*3\r\n$3\r\nSET\r\n$3\r\nk\r\n\r\n$0\r\n\r\n");
    }

    #[test]
    fn test_format_plain_tokens() {
        let cmd = format_command("  GET   foo ", &[]).unwrap();
        assert_eq!(cmd, encode_args(["GET", "foo"]));
    }

    #[test]
    fn test_format_empty_placeholder_is_kept() {
        let cmd = format_command("SET %s %s", &[b"k", b""]).unwrap();
        assert_eq!(cmd, encode_args(["SET", "k", ""]));
    }

    #[test]
    fn test_format_percent_literal() {
        let cmd = format_command("SET k 100%%", &[]).unwrap();
        assert_eq!(cmd, encode_args(["SET", "k", "100%"]));
    }

    #[test]
    fn test_format_argument_count_mismatch() {
        assert!(matches!(format_command("GET %s", &[]), Err(ParseError::Format(_))));
        assert!(matches!(format_command("GET %s", &[b"a", b"b"]), Err(ParseError::Format(_))));
    }

    #[test]
    fn test_format_rejects_unknown_conversion() {
        assert!(matches!(format_command("GET %d", &[b"1"]), Err(ParseError::Format(_))));
        assert!(matches!(format_command("GET %", &[]), Err(ParseError::Format(_))));
        assert!(matches!(format_command("   ", &[]), Err(ParseError::Format(_))));
    }
}
