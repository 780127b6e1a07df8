//! RESP Protocol Codec
//!
//! Decoding and encoding of the length-prefixed, type-tagged wire format
//! spoken by clients.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` tree and its encoder
//! - `parser`: the incremental decoder
//!
//! ## Example
//!
//! ```
//! use respkv::protocol::{parse_message, RespValue};
//! use bytes::Bytes;
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (value, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//!
//! let reply = RespValue::bulk_string(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseOutcome, ParseResult, RespParser};
pub use types::RespValue;
