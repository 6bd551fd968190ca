//! Wire Value Types
//!
//! Requests arrive as arrays of bulk strings. Replies use any variant.
//!
//! ```text
//! +OK\r\n                                  simple string
//! -ERR seconds is not a number\r\n         error
//! $3\r\nbar\r\n                            bulk string
//! *2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n         array
//! $-1\r\n                                  null
//! ```
//!
//! Simple strings and errors are line-delimited, so they must not contain
//! CR or LF. Bulk strings carry their length and may hold any bytes.

use bytes::Bytes;
use std::fmt;

pub const CRLF: &[u8] = b"\r\n";

/// Leading byte of each frame kind
pub mod prefix {
    pub const SIMPLE: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const BULK: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// Wire form of [`RespValue::Null`]
pub const NULL_BULK: &[u8] = b"$-1\r\n";

/// A value on the wire.
///
/// Every variant has an encoding, so [`RespValue::serialize`] cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status line such as `OK` or `PONG`
    SimpleString(String),
    /// Failure line, conventionally starting with `ERR`
    Error(String),
    BulkString(Bytes),
    Array(Vec<RespValue>),
    /// Absent value (`$-1`)
    Null,
}

impl RespValue {
    /// ```
    /// use tidekv::protocol::types::RespValue;
    /// assert_eq!(RespValue::simple_string("OK"), RespValue::ok());
    /// ```
    pub fn simple_string(text: impl Into<String>) -> Self {
        Self::SimpleString(text.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn bulk_string(payload: impl Into<Bytes>) -> Self {
        Self::BulkString(payload.into())
    }

    pub fn null() -> Self {
        Self::Null
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        Self::Array(items)
    }

    pub fn ok() -> Self {
        Self::simple_string("OK")
    }

    pub fn pong() -> Self {
        Self::simple_string("PONG")
    }

    /// Encodes the value into a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        self.serialize_into(&mut out);
        out
    }

    /// Appends the encoding of the value to `out`.
    ///
    /// A request decoded from a frame encodes back to the same bytes, which
    /// is what the AOF relies on.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::SimpleString(text) => write_line(out, prefix::SIMPLE, text.as_bytes()),
            Self::Error(message) => write_line(out, prefix::ERROR, message.as_bytes()),
            Self::BulkString(payload) => {
                write_header(out, prefix::BULK, payload.len());
                out.extend_from_slice(payload);
                out.extend_from_slice(CRLF);
            }
            Self::Array(items) => {
                write_header(out, prefix::ARRAY, items.len());
                for item in items {
                    item.serialize_into(out);
                }
            }
            Self::Null => out.extend_from_slice(NULL_BULK),
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Self::SimpleString(text) | Self::Error(text) => text.len() + 3,
            Self::BulkString(payload) => payload.len() + 16,
            Self::Array(items) => 16 + items.iter().map(Self::encoded_len_hint).sum::<usize>(),
            Self::Null => NULL_BULK.len(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The payload of a bulk string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        if let Self::BulkString(payload) = self {
            Some(payload)
        } else {
            None
        }
    }

    /// The elements of an array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        if let Self::Array(items) = self {
            Some(items)
        } else {
            None
        }
    }
}

fn write_line(out: &mut Vec<u8>, kind: u8, body: &[u8]) {
    out.push(kind);
    out.extend_from_slice(body);
    out.extend_from_slice(CRLF);
}

fn write_header(out: &mut Vec<u8>, kind: u8, len: usize) {
    write_line(out, kind, len.to_string().as_bytes());
}

/// Single-line rendering for log output.
impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SimpleString(text) => write!(f, "+{}", text),
            Self::Error(message) => write!(f, "-{}", message),
            Self::BulkString(payload) => match std::str::from_utf8(payload) {
                Ok(text) => write!(f, "{:?}", text),
                Err(_) => write!(f, "<{} bytes>", payload.len()),
            },
            Self::Null => f.write_str("nil"),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}
