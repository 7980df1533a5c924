//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse store replies, keeping
//! allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Every argument travels as a length-prefixed bulk string,
//!    so spaces, quotes and CRLF inside keys or values need no escaping.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::{BufRead, Read};

use bytes::BufMut;

use crate::error::{ClientError, ClientResult};

/// Maximum bulk string size accepted from the wire (512 MiB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements accepted in one array reply.
pub const MAX_ARRAY_LEN: usize = 1_000_000;

// Upper bound on up-front reservation; larger payloads grow as bytes arrive.
const MAX_PREALLOC: usize = 64 * 1024;

/// RESP2 reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style status replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings.
    Bulk(Vec<u8>),
    /// *... arrays.
    Array(Vec<RespValue>),
    /// $-1 or *-1.
    Nil,
}

impl RespValue {
    /// Returns true for error-typed replies.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns the textual payload of a status or bulk reply.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(data) => {
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>, B: BufMut>(args: &[A], out: &mut B) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Nil);
    }
    let len = usize::try_from(len).map_err(|_| ClientError::Protocol)?;
    if len > MAX_BULK_SIZE {
        return Err(ClientError::Protocol);
    }
    let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(data))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Nil);
    }
    let len = usize::try_from(len).map_err(|_| ClientError::Protocol)?;
    if len > MAX_ARRAY_LEN {
        return Err(ClientError::Protocol);
    }

    let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize<B: BufMut>(out: &mut B, mut value: usize) {
    // Digits go through a stack buffer; no heap formatting on the hot path.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> ClientResult<RespValue> {
        let mut reader = Cursor::new(bytes.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line)
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&["GET", "key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encodes_values_with_spaces_and_crlf_verbatim() {
        let mut buf = Vec::new();
        encode_command(&["SET", "k", "a b\r\nc"], &mut buf);
        assert_eq!(&buf, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$6\r\na b\r\nc\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_bulk_string() {
        assert_eq!(parse(b"$5\r\nhello\r\n").unwrap(), RespValue::Bulk(b"hello".to_vec()));
    }

    #[test]
    fn parses_null_bulk_and_null_array() {
        assert_eq!(parse(b"$-1\r\n").unwrap(), RespValue::Nil);
        assert_eq!(parse(b"*-1\r\n").unwrap(), RespValue::Nil);
    }

    #[test]
    fn parses_integer() {
        assert_eq!(parse(b":42\r\n").unwrap(), RespValue::Integer(42));
        assert_eq!(parse(b":-7\r\n").unwrap(), RespValue::Integer(-7));
    }

    #[test]
    fn parses_error() {
        let resp = parse(b"-ERR bad\r\n").unwrap();
        assert!(resp.is_error());
        assert_eq!(resp, RespValue::Error(b"ERR bad".to_vec()));
    }

    #[test]
    fn parses_nested_array_with_nil_element() {
        let resp = parse(b"*3\r\n$1\r\na\r\n$-1\r\n:5\r\n").unwrap();
        assert_eq!(
            resp,
            RespValue::Array(vec![
                RespValue::Bulk(b"a".to_vec()),
                RespValue::Nil,
                RespValue::Integer(5),
            ])
        );
    }

    #[test]
    fn rejects_bad_framing() {
        assert!(matches!(parse(b"?what\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b":12\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b":-\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b""), Err(ClientError::Protocol)));
    }

    #[test]
    fn rejects_oversized_lengths_without_allocating() {
        assert!(matches!(parse(b"*9223372036854775807\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"$9223372036854775807\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"$536870913\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"*1000001\r\n"), Err(ClientError::Protocol)));
    }

    #[test]
    fn truncated_payloads_are_fatal() {
        let short_bulk = parse(b"$1000\r\nabc");
        assert!(matches!(&short_bulk, Err(err) if err.is_fatal()));
        let short_array = parse(b"*500000\r\n:1\r\n");
        assert!(matches!(&short_array, Err(err) if err.is_fatal()));
    }
}
