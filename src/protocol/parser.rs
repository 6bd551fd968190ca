//! Incremental Frame Parser
//!
//! Decodes one value from the front of a byte buffer. Live connections and
//! AOF replay share it.
//!
//! [`RespParser::parse`] returns:
//! - `Ok(Some((value, consumed)))` when a whole frame is at the front of the
//!   buffer; the caller drops `consumed` bytes and may call again for the
//!   next pipelined frame
//! - `Ok(None)` when the frame is still incomplete
//! - `Err(ParseError)` when the bytes cannot be a valid frame, however much
//!   more arrives
//!
//! Nothing is retained between calls, so an incomplete frame is simply
//! decoded again from the start once more bytes are buffered.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Leading byte is not a known type marker
    #[error("unknown type: {0:#04x}")]
    UnknownType(u8),

    /// Length line is not a decimal integer
    #[error("invalid length: {0}")]
    InvalidLength(String),

    /// Simple string or error text is not UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Negative bulk length other than the null marker `-1`
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest accepted bulk string (512 MB)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Deepest accepted array nesting
pub const MAX_NESTING_DEPTH: usize = 32;

/// A decoded value and the offset just past it.
type Decoded = Option<(RespValue, usize)>;

/// Decodes frames from a byte buffer.
///
/// ```
/// use tidekv::protocol::RespParser;
///
/// let mut parser = RespParser::new();
/// let buf = b"*1\r\n$4\r\nPING\r\n*1\r\n$4";
///
/// let (_, consumed) = parser.parse(buf).unwrap().unwrap();
/// assert_eq!(consumed, 14);
/// assert!(parser.parse(&buf[consumed..]).unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    frames: u64,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to decode one value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let decoded = decode(buf, 0, 0)?;
        if decoded.is_some() {
            self.frames += 1;
        }
        Ok(decoded)
    }

    /// Number of complete frames decoded so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Decodes the value starting at `at`.
fn decode(buf: &[u8], at: usize, depth: usize) -> ParseResult<Decoded> {
    let Some(&kind) = buf.get(at) else {
        return Ok(None);
    };

    match kind {
        prefix::ARRAY => decode_array(buf, at, depth),
        prefix::BULK => decode_bulk(buf, at),
        prefix::SIMPLE => Ok(read_text(buf, at)?.map(|(text, next)| (RespValue::SimpleString(text), next))),
        prefix::ERROR => Ok(read_text(buf, at)?.map(|(text, next)| (RespValue::Error(text), next))),
        other => Err(ParseError::UnknownType(other)),
    }
}

/// `$<len>\r\n<payload>\r\n`, or `$-1\r\n` for null
fn decode_bulk(buf: &[u8], at: usize) -> ParseResult<Decoded> {
    let Some((len, start)) = read_length(buf, at)? else {
        return Ok(None);
    };

    let len = match len {
        -1 => return Ok(Some((RespValue::Null, start))),
        n if n < 0 => return Err(ParseError::InvalidBulkLength(n)),
        n => n as usize,
    };
    if len > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: len,
            max: MAX_BULK_SIZE,
        });
    }

    let end = start + len;
    let Some(terminator) = buf.get(end..end + CRLF.len()) else {
        return Ok(None);
    };
    if terminator != CRLF {
        return Err(ParseError::ProtocolError(format!(
            "bulk string of {} bytes not followed by CRLF",
            len
        )));
    }

    let payload = Bytes::copy_from_slice(&buf[start..end]);
    Ok(Some((RespValue::BulkString(payload), end + CRLF.len())))
}

/// `*<count>\r\n` followed by `count` values
fn decode_array(buf: &[u8], at: usize, depth: usize) -> ParseResult<Decoded> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(ParseError::ProtocolError(format!(
            "arrays nested deeper than {}",
            MAX_NESTING_DEPTH
        )));
    }

    let Some((count, mut next)) = read_length(buf, at)? else {
        return Ok(None);
    };
    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }

    // count is client-controlled, so don't trust it for the allocation
    let mut items = Vec::with_capacity((count as usize).min(64));
    for _ in 0..count {
        let Some((item, after)) = decode(buf, next, depth + 1)? else {
            return Ok(None);
        };
        items.push(item);
        next = after;
    }

    Ok(Some((RespValue::Array(items), next)))
}

/// Reads the line after the type byte at `at`. Returns the line body and the
/// offset just past its CRLF.
fn read_line(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let body = &buf[at + 1..];
    let end = body.windows(CRLF.len()).position(|w| w == CRLF)?;
    Some((&body[..end], at + 1 + end + CRLF.len()))
}

fn read_length(buf: &[u8], at: usize) -> ParseResult<Option<(i64, usize)>> {
    let Some((line, next)) = read_line(buf, at) else {
        return Ok(None);
    };
    let len = std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| ParseError::InvalidLength(String::from_utf8_lossy(line).into_owned()))?;
    Ok(Some((len, next)))
}

fn read_text(buf: &[u8], at: usize) -> ParseResult<Option<(String, usize)>> {
    let Some((line, next)) = read_line(buf, at) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    Ok(Some((text.to_owned(), next)))
}

/// Decodes a single frame with a throwaway parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
