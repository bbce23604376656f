//! # RESP2 Framing
//!
//! Purpose: Encode outgoing commands and decode replies for the handful of
//! commands the template issues.
//!
//! ## Design Principles
//! 1. **Caller-Owned Buffers**: The session hands in its buffers; nothing here allocates per call
//!    except reply payloads.
//! 2. **Binary-Safe**: Bulk strings are raw bytes until a command helper decodes them.
//! 3. **Null Is Not Empty**: `$-1` and `*-1` decode to `None`, distinct from empty payloads.
//! 4. **Fail Fast**: Malformed framing is a protocol error; the session is then discarded.

use std::io::{BufRead, Read, Write};

use crate::error::{SessionError, SessionResult};

const MAX_PREALLOC_ITEMS: usize = 1024;
const MAX_PREALLOC_BYTES: usize = 64 * 1024;

/// Decoded reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` style status.
    Simple(Vec<u8>),
    /// `-ERR ...` reply.
    Error(Vec<u8>),
    /// `:42`
    Integer(i64),
    /// `$n` bulk string, `None` for `$-1`.
    Bulk(Option<Vec<u8>>),
    /// `*n` array, `None` for `*-1`.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Turns an error reply into `SessionError::Server`, passing other replies through.
    pub fn into_result(self) -> SessionResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(SessionError::Server { message }),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> SessionResult<i64> {
        match self.into_result()? {
            RespValue::Integer(value) => Ok(value),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }

    pub fn into_status(self) -> SessionResult<String> {
        match self.into_result()? {
            RespValue::Simple(text) => Ok(String::from_utf8(text)?),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }

    /// Decodes a bulk string; a null bulk is `None`.
    pub fn into_optional_string(self) -> SessionResult<Option<String>> {
        match self.into_result()? {
            RespValue::Bulk(Some(data)) => Ok(Some(String::from_utf8(data)?)),
            RespValue::Bulk(None) => Ok(None),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }

    /// Decodes an array of bulk strings; a null array is `None`.
    pub fn into_string_array(self) -> SessionResult<Option<Vec<String>>> {
        let items = match self.into_result()? {
            RespValue::Array(Some(items)) => items,
            RespValue::Array(None) => return Ok(None),
            _ => return Err(SessionError::UnexpectedResponse),
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(data)) => Ok(String::from_utf8(data)?),
                RespValue::Simple(text) => Ok(String::from_utf8(text)?),
                _ => Err(SessionError::UnexpectedResponse),
            })
            .collect::<SessionResult<Vec<_>>>()
            .map(Some)
    }
}

/// Appends `args` to `out` as a RESP2 array of bulk strings.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    // Writing into a Vec cannot fail.
    let _ = write!(out, "*{}\r\n", args.len());
    for arg in args {
        let _ = write!(out, "${}\r\n", arg.len());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one complete reply. `line_buf` is scratch space owned by the session.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> SessionResult<RespValue> {
    read_line(reader, line_buf)?;
    let (&tag, rest) = line_buf.split_first().ok_or(SessionError::Protocol)?;

    match tag {
        b'+' => Ok(RespValue::Simple(rest.to_vec())),
        b'-' => Ok(RespValue::Error(rest.to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
        b'$' => {
            let len = parse_i64(rest)?;
            read_bulk(reader, len).map(RespValue::Bulk)
        }
        b'*' => {
            let len = parse_i64(rest)?;
            if len < 0 {
                return Ok(RespValue::Array(None));
            }
            // The header is untrusted; grow past this as elements arrive.
            let mut items = Vec::with_capacity((len as usize).min(MAX_PREALLOC_ITEMS));
            for _ in 0..len {
                items.push(read_response(reader, line_buf)?);
            }
            Ok(RespValue::Array(Some(items)))
        }
        _ => Err(SessionError::Protocol),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> SessionResult<Option<Vec<u8>>> {
    if len < 0 {
        return Ok(None);
    }
    let expected = len as u64;
    let mut data = Vec::with_capacity((len as usize).min(MAX_PREALLOC_BYTES));
    reader.by_ref().take(expected).read_to_end(&mut data)?;
    if data.len() as u64 != expected {
        return Err(SessionError::Protocol);
    }
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if &crlf != b"\r\n" {
        return Err(SessionError::Protocol);
    }
    Ok(Some(data))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> SessionResult<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        // Peer closed the socket, e.g. after a forced shutdown.
        return Err(SessionError::Protocol);
    }
    if !buf.ends_with(b"\r\n") {
        return Err(SessionError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> SessionResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(SessionError::Protocol)
}
