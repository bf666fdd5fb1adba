//! Request framing: RESP arrays of bulk strings, or inline command lines

use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Result};

/// Largest bulk argument accepted from a client
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Decode one request from the front of `buf`.
///
/// Returns `Ok(None)` while the request is incomplete; nothing is consumed
/// in that case. An inline line that is blank decodes to an empty request.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] == b'*' {
        decode_array(buf)
    } else {
        decode_inline(buf)
    }
}

fn find_line(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| from + p)
}

fn parse_len(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::syntax("Protocol error: invalid length"))
}

fn decode_array(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>> {
    let Some(end) = find_line(buf, 1) else {
        return Ok(None);
    };
    let count = parse_len(&buf[1..end])?;
    let mut pos = end + 2;
    if count <= 0 {
        buf.advance(pos);
        return Ok(Some(Vec::new()));
    }

    let mut spans = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(Error::syntax(format!(
                "Protocol error: expected '$', got '{}'",
                buf[pos] as char
            )));
        }
        let Some(end) = find_line(buf, pos + 1) else {
            return Ok(None);
        };
        let len = parse_len(&buf[pos + 1..end])?;
        if len < 0 || len as usize > MAX_BULK_LEN {
            return Err(Error::syntax("Protocol error: invalid bulk length"));
        }
        let start = end + 2;
        let stop = start + len as usize;
        if buf.len() < stop + 2 {
            return Ok(None);
        }
        if &buf[stop..stop + 2] != b"\r\n" {
            return Err(Error::syntax("Protocol error: bulk string not terminated"));
        }
        spans.push((start, stop));
        pos = stop + 2;
    }

    let frame = buf.split_to(pos).freeze();
    Ok(Some(spans.into_iter().map(|(a, b)| frame.slice(a..b)).collect()))
}

fn decode_inline(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_BULK_LEN {
            return Err(Error::syntax("Protocol error: inline request too long"));
        }
        return Ok(None);
    };
    let line = buf.split_to(newline + 1);
    let text = std::str::from_utf8(&line)
        .map_err(|_| Error::syntax("Protocol error: inline request is not UTF-8"))?;
    let tokens = split_inline(text.trim_end_matches(['\r', '\n']))?;
    Ok(Some(tokens.into_iter().map(Bytes::from).collect()))
}

/// Split an inline command on whitespace. Double quotes allow backslash
/// escapes; single quotes are literal.
pub fn split_inline(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut token = String::new();
        match first {
            '"' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => token.push('\n'),
                            Some('r') => token.push('\r'),
                            Some('t') => token.push('\t'),
                            Some(c) => token.push(c),
                            None => return Err(Error::syntax("Protocol error: unbalanced quotes")),
                        },
                        Some(c) => token.push(c),
                        None => return Err(Error::syntax("Protocol error: unbalanced quotes")),
                    }
                }
            }
            '\'' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => token.push(c),
                        None => return Err(Error::syntax("Protocol error: unbalanced quotes")),
                    }
                }
            }
            _ => {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    token.push(c);
                }
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_frame() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n*1\r\n"[..]);
        let request = decode(&mut buf).unwrap().unwrap();
        assert_eq!(request, vec![Bytes::from("PING"), Bytes::from("hi")]);
        assert_eq!(&buf[..], b"*1\r\n");
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_array_consumes_nothing() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n$2\r\nh"[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn test_binary_bulk_is_preserved() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\n\x00\r\n\x01\r\n"[..]);
        let request = decode(&mut buf).unwrap().unwrap();
        assert_eq!(&request[0][..], b"\x00\r\n\x01");
    }

    #[test]
    fn test_inline_quoting() {
        let mut buf = BytesMut::from(&b"SEARCH idx \"hello world\" 'a\\b'\r\n"[..]);
        let request = decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            request,
            vec![
                Bytes::from("SEARCH"),
                Bytes::from("idx"),
                Bytes::from("hello world"),
                Bytes::from("a\\b"),
            ]
        );
        assert!(split_inline("\"open").is_err());
    }

    #[test]
    fn test_bad_bulk_marker() {
        let mut buf = BytesMut::from(&b"*1\r\n:4\r\n"[..]);
        assert!(matches!(decode(&mut buf), Err(Error::Syntax(_))));
    }
}
