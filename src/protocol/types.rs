//! RESP Value Types and Encoding
//!
//! Every value on the wire starts with a one-byte type tag and ends with CRLF:
//!
//! - `+` Simple String: `+OK\r\n`
//! - `-` Error: `-ERR unknown command 'foo'\r\n`
//! - `:` Integer: `:42\r\n`
//! - `$` Bulk String: `$3\r\nfoo\r\n`, null bulk string `$-1\r\n`
//! - `*` Array: `*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n`
//!
//! The null bulk string has its own variant, [`RespValue::Null`]. It is never
//! represented as an empty bulk string: `$0\r\n\r\n` and `$-1\r\n` are
//! different values.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// One decoded unit of the wire protocol.
///
/// Values are built once per decode call and owned by whoever decoded them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Line-oriented string. Any CR or LF in the content is written as a
    /// space so the line cannot end early.
    /// Format: `+<bytes>\r\n`
    SimpleString(Bytes),

    /// Error reply. CR and LF are written as spaces, as for simple strings.
    /// Format: `-<message>\r\n`
    Error(String),

    /// 64-bit signed integer.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe string with an explicit length.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string (`$-1\r\n`). A null array (`*-1\r\n`) decodes to this too.
    Null,

    /// Ordered sequence of values, possibly nested.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates a new simple string value.
    ///
    /// # Example
    /// ```
    /// use respkv::protocol::types::RespValue;
    /// let ok = RespValue::simple_string("OK");
    /// assert_eq!(ok.serialize(), b"+OK\r\n");
    /// ```
    pub fn simple_string(s: impl Into<Bytes>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new error reply.
    ///
    /// # Example
    /// ```
    /// use respkv::protocol::types::RespValue;
    /// let err = RespValue::error("ERR unknown command 'FOO'");
    /// assert!(err.is_error());
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a new bulk string value.
    ///
    /// # Example
    /// ```
    /// use respkv::protocol::types::RespValue;
    /// use bytes::Bytes;
    /// let bulk = RespValue::bulk_string(Bytes::from("hey"));
    /// assert_eq!(bulk.serialize(), b"$3\r\nhey\r\n");
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// `+OK\r\n`
    pub fn ok() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"OK"))
    }

    /// `+PONG\r\n`
    pub fn pong() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"PONG"))
    }

    /// Encodes the value into its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Encodes the value, appending to an existing buffer.
    ///
    /// Nested arrays are written with an explicit stack, so encoding a deeply
    /// nested value does not grow the call stack.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        let mut pending: Vec<&RespValue> = vec![self];

        while let Some(value) = pending.pop() {
            match value {
                RespValue::SimpleString(s) => {
                    buf.push(prefix::SIMPLE_STRING);
                    write_line(buf, s);
                }
                RespValue::Error(s) => {
                    buf.push(prefix::ERROR);
                    write_line(buf, s.as_bytes());
                }
                RespValue::Integer(n) => {
                    buf.push(prefix::INTEGER);
                    buf.extend_from_slice(n.to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                }
                RespValue::BulkString(data) => {
                    buf.push(prefix::BULK_STRING);
                    buf.extend_from_slice(data.len().to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                    buf.extend_from_slice(data);
                    buf.extend_from_slice(CRLF);
                }
                RespValue::Null => {
                    buf.push(prefix::BULK_STRING);
                    buf.extend_from_slice(b"-1");
                    buf.extend_from_slice(CRLF);
                }
                RespValue::Array(values) => {
                    buf.push(prefix::ARRAY);
                    buf.extend_from_slice(values.len().to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                    // Reversed so the first element is popped first.
                    pending.extend(values.iter().rev());
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns the content of a SimpleString or BulkString.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::SimpleString(b) | RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the content of a SimpleString or BulkString if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

/// Writes `line` followed by CRLF, with every CR or LF inside it replaced by
/// a space.
fn write_line(buf: &mut Vec<u8>, line: &[u8]) {
    buf.extend(
        line.iter()
            .map(|&b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(data) | RespValue::BulkString(data) => {
                match std::str::from_utf8(data) {
                    Ok(s) => write!(f, "\"{}\"", s),
                    Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
                }
            }
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
