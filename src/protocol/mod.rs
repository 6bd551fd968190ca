//! Wire Protocol
//!
//! Binary, stream-oriented framing shared by client connections and the
//! append-only file. The codec knows nothing about commands or storage.
//!
//! ## Modules
//!
//! - `types`: Defines the `RespValue` enum and its encoder
//! - `parser`: Incremental decoder for incoming frames
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{parse_message, RespValue};
//! use bytes::Bytes;
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (value, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//! assert_eq!(value.as_array().map(|a| a.len()), Some(2));
//!
//! let reply = RespValue::bulk_string(Bytes::from("bar"));
//! assert_eq!(reply.serialize(), b"$3\r\nbar\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
