//! Incremental RESP Decoder
//!
//! The decoder works on a byte buffer that holds whatever has arrived on a
//! connection so far. Each call returns one of:
//!
//! - `Ok(Some((value, consumed)))` - a complete value; exactly `consumed` bytes
//!   belong to it and the caller advances its buffer by that much, leaving the
//!   next pipelined request at the front
//! - `Ok(None)` - the buffer only holds a prefix of a value
//! - `Err(ParseError)` - the input is malformed
//!
//! A parse error leaves the byte stream in an unknown position. Callers must
//! close the connection rather than try to resynchronize.
//!
//! ## Arrays
//!
//! Arrays are decoded with an explicit stack of partially filled arrays
//! instead of recursion. The stack height is the nesting depth and is capped
//! by [`RespParser::with_max_depth`], so hostile input cannot grow the call
//! stack or allocate without bound.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP decoding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The stream ended before a complete value was read
    #[error("unexpected end of stream")]
    Truncated,

    /// Unknown type prefix byte
    #[error("invalid type byte: {0:#04x}")]
    UnknownPrefix(u8),

    /// Length, count or integer line is not a decimal number
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in an error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Arrays nested deeper than the parser allows
    #[error("max depth exceeded: {max}")]
    MaxDepthExceeded { max: usize },

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ParseError {
    /// Returns true if the peer simply stopped sending mid-value, as opposed
    /// to sending something malformed.
    pub fn is_truncation(&self) -> bool {
        matches!(self, ParseError::Truncated)
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Default maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Upper bound on capacity reserved up front for an array, whatever count the
/// peer declares. The vector still grows to the real element count.
const MAX_PREALLOC: usize = 1024;

/// One step of decoding: either a finished scalar, or the header of an array
/// whose elements follow.
enum Frame {
    Value(RespValue),
    ArrayHeader(usize),
}

/// An array whose header has been read but whose elements are still arriving.
struct PendingArray {
    expected: usize,
    elements: Vec<RespValue>,
}

/// Outcome of [`RespParser::parse_partial`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A whole value and the number of bytes it used
    Complete(RespValue, usize),
    /// Not enough bytes yet.
    Incomplete {
        /// The buffer must grow to at least this length
        needed: usize,
        /// Bulk string payload bytes declared so far, including the one
        /// still arriving. The rest of the buffer is framing.
        payload: usize,
    },
}

/// A RESP decoder.
///
/// # Example
///
/// ```
/// use respkv::protocol::{RespParser, RespValue};
/// use bytes::Bytes;
///
/// let parser = RespParser::new();
/// let buffer = b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n";
///
/// let (value, consumed) = parser.parse(buffer).unwrap().unwrap();
/// assert_eq!(consumed, buffer.len());
/// assert_eq!(
///     value,
///     RespValue::array(vec![
///         RespValue::bulk_string(Bytes::from("ECHO")),
///         RespValue::bulk_string(Bytes::from("hey")),
///     ])
/// );
/// ```
#[derive(Debug, Clone)]
pub struct RespParser {
    max_depth: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    /// Creates a parser with the default nesting limit.
    pub fn new() -> Self {
        Self::with_max_depth(MAX_NESTING_DEPTH)
    }

    /// Creates a parser that rejects arrays nested more than `max_depth` deep.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Attempts to decode one value from the front of `buf`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((value, consumed)))` - Successfully decoded a value
    /// - `Ok(None)` - Incomplete data, need more bytes
    /// - `Err(e)` - Malformed input
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        Ok(match self.parse_partial(buf)? {
            ParseOutcome::Complete(value, consumed) => Some((value, consumed)),
            ParseOutcome::Incomplete { .. } => None,
        })
    }

    /// Like [`parse`](Self::parse), but an incomplete value also reports the
    /// smallest buffer length that could hold it and how much of the
    /// buffered request is bulk payload.
    pub fn parse_partial(&self, buf: &[u8]) -> ParseResult<ParseOutcome> {
        let mut pos = 0;
        let mut payload = 0;
        let mut stack: Vec<PendingArray> = Vec::new();

        'frames: loop {
            let (frame, consumed) = match parse_frame(&buf[pos..])? {
                Step::Frame(frame, consumed) => (frame, consumed),
                Step::Need { len, payload: pending } => {
                    return Ok(ParseOutcome::Incomplete {
                        needed: pos + len,
                        payload: payload + pending,
                    })
                }
            };
            pos += consumed;
            if let Frame::Value(RespValue::BulkString(data)) = &frame {
                payload += data.len();
            }

            let mut value = match frame {
                Frame::Value(value) => value,
                Frame::ArrayHeader(count) => {
                    if stack.len() >= self.max_depth {
                        return Err(ParseError::MaxDepthExceeded {
                            max: self.max_depth,
                        });
                    }
                    if count > 0 {
                        stack.push(PendingArray {
                            expected: count,
                            elements: Vec::with_capacity(count.min(MAX_PREALLOC)),
                        });
                        continue 'frames;
                    }
                    RespValue::Array(Vec::new())
                }
            };

            // Hand the finished value to its enclosing array, closing every
            // array that this value completes.
            while let Some(mut parent) = stack.pop() {
                parent.elements.push(value);
                if parent.elements.len() < parent.expected {
                    stack.push(parent);
                    continue 'frames;
                }
                value = RespValue::Array(parent.elements);
            }

            return Ok(ParseOutcome::Complete(value, pos));
        }
    }

    /// Decodes one value from a stream that will not grow any further.
    ///
    /// An incomplete value is reported as [`ParseError::Truncated`].
    pub fn decode(&self, buf: &[u8]) -> ParseResult<(RespValue, usize)> {
        self.parse(buf)?.ok_or(ParseError::Truncated)
    }
}

/// Result of decoding one frame at the front of a buffer.
enum Step {
    Frame(Frame, usize),
    /// The buffer must be at least `len` long before the frame can finish.
    /// `payload` is the declared length of a bulk string still arriving.
    Need { len: usize, payload: usize },
}

/// Reads one tag byte and everything that belongs to it, except array elements.
fn parse_frame(buf: &[u8]) -> ParseResult<Step> {
    let Some(&tag) = buf.first() else {
        return Ok(Step::Need { len: 1, payload: 0 });
    };

    // The tag alone decides validity; don't wait for a line that may never come.
    if !matches!(
        tag,
        prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER | prefix::BULK_STRING | prefix::ARRAY
    ) {
        return Err(ParseError::UnknownPrefix(tag));
    }

    // Every type starts with a CRLF-terminated line after the tag.
    let line_end = match find_crlf(&buf[1..]) {
        Some(pos) => pos,
        None => {
            return Ok(Step::Need {
                len: buf.len() + 1,
                payload: 0,
            })
        }
    };
    let line = &buf[1..1 + line_end];
    let header_len = 1 + line_end + 2;

    let frame = match tag {
        prefix::SIMPLE_STRING => Frame::Value(RespValue::SimpleString(Bytes::copy_from_slice(line))),
        prefix::ERROR => {
            let s = std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Frame::Value(RespValue::Error(s.to_string()))
        }
        prefix::INTEGER => Frame::Value(RespValue::Integer(parse_decimal(line)?)),
        prefix::BULK_STRING => return parse_bulk_body(buf, parse_decimal(line)?, header_len),
        prefix::ARRAY => match parse_decimal(line)? {
            -1 => Frame::Value(RespValue::Null),
            count if count < 0 => return Err(ParseError::InvalidArrayLength(count)),
            count => Frame::ArrayHeader(count as usize),
        },
        other => return Err(ParseError::UnknownPrefix(other)),
    };

    Ok(Step::Frame(frame, header_len))
}

/// Reads the payload of a bulk string whose length line has been parsed.
fn parse_bulk_body(buf: &[u8], length: i64, data_start: usize) -> ParseResult<Step> {
    if length == -1 {
        return Ok(Step::Frame(Frame::Value(RespValue::Null), data_start));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total_needed = data_start + length + 2;
    if buf.len() < total_needed {
        return Ok(Step::Need {
            len: total_needed,
            payload: length,
        });
    }

    // The declared length must land exactly on the terminator.
    if &buf[data_start + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string length does not match payload".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Step::Frame(Frame::Value(RespValue::BulkString(data)), total_needed))
}

/// Parses a length, count or integer line: an optional `-` followed by
/// ASCII digits, nothing else.
fn parse_decimal(line: &[u8]) -> ParseResult<i64> {
    let digits = line.strip_prefix(b"-").unwrap_or(line);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::InvalidInteger(format!(
            "{:?}",
            String::from_utf8_lossy(line)
        )));
    }

    // Only ASCII at this point
    let s = std::str::from_utf8(line).map_err(|e| ParseError::InvalidInteger(e.to_string()))?;
    s.parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(format!("{:?}: {}", s, e)))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Decodes a single message with a default parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::bulk_string(Bytes::from(s.to_string()))
    }

    #[test]
    fn test_parse_simple_string() {
        let (value, consumed) = parse_message(b"+foo\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::simple_string("foo"));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_simple_string_is_verbatim_bytes() {
        let (value, _) = parse_message(b"+\xff\x00ok\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::SimpleString(Bytes::from_static(b"\xff\x00ok")));
    }

    #[test]
    fn test_parse_simple_string_incomplete() {
        assert!(parse_message(b"+OK").unwrap().is_none());
        assert!(parse_message(b"+OK\r").unwrap().is_none());
    }

    #[test]
    fn test_parse_error() {
        let input = b"-ERR unknown command 'FOO'\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(value, RespValue::error("ERR unknown command 'FOO'"));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_integer() {
        let (value, consumed) = parse_message(b":-42\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Integer(-42));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_parse_invalid_integer() {
        let result = parse_message(b":not_a_number\r\n");
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));
    }

    #[test]
    fn test_parse_bulk_string() {
        let (value, consumed) = parse_message(b"$3\r\nfoo\r\n").unwrap().unwrap();
        assert_eq!(value, bulk("foo"));
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_parse_bulk_string_bad_length() {
        let result = parse_message(b"$abc\r\nfoo\r\n");
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));

        let result = parse_message(b"$-2\r\n");
        assert_eq!(result, Err(ParseError::InvalidBulkLength(-2)));
    }

    #[test]
    fn test_parse_bulk_string_too_large() {
        let result = parse_message(b"$536870913\r\n");
        assert!(matches!(result, Err(ParseError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let (value, consumed) = parse_message(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_parse_empty_bulk_string() {
        let (value, consumed) = parse_message(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(value, bulk(""));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_bulk_string_one_byte_short_is_truncated() {
        let parser = RespParser::new();
        assert!(parser.parse(b"$3\r\nfo\r\n").unwrap().is_none());
        assert_eq!(parser.decode(b"$3\r\nfo\r\n"), Err(ParseError::Truncated));
    }

    #[test]
    fn test_bulk_string_one_byte_long_is_rejected() {
        // The decoder never skips ahead to the next CRLF.
        let result = parse_message(b"$3\r\nfooo\r\n");
        assert!(matches!(result, Err(ParseError::ProtocolError(_))));
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let (value, _) = parse_message(b"$5\r\nhe\r\no\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::bulk_string(Bytes::from_static(b"he\r\no")));
    }

    #[test]
    fn test_parse_array() {
        let input = b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("ECHO"), bulk("hey")]));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_array_incomplete() {
        let input = b"*2\r\n$4\r\nECHO\r\n$3\r\nhe";
        assert!(parse_message(input).unwrap().is_none());
        assert_eq!(RespParser::new().decode(input), Err(ParseError::Truncated));
    }

    #[test]
    fn test_parse_null_and_empty_array() {
        let (value, _) = parse_message(b"*-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);

        let (value, consumed) = parse_message(b"*0\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![]));
        assert_eq!(consumed, 4);

        assert_eq!(
            parse_message(b"*-3\r\n"),
            Err(ParseError::InvalidArrayLength(-3))
        );
    }

    #[test]
    fn test_parse_nested_array() {
        let input = b"*3\r\n:1\r\n*2\r\n:2\r\n*0\r\n+x\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2), RespValue::Array(vec![])]),
                RespValue::simple_string("x"),
            ])
        );
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_max_depth_exceeded() {
        let parser = RespParser::with_max_depth(3);

        let ok = b"*1\r\n*1\r\n*1\r\n:1\r\n";
        assert!(parser.parse(ok).unwrap().is_some());

        let too_deep = b"*1\r\n*1\r\n*1\r\n*1\r\n:1\r\n";
        assert_eq!(
            parser.parse(too_deep),
            Err(ParseError::MaxDepthExceeded { max: 3 })
        );
    }

    #[test]
    fn test_hostile_nesting_does_not_overflow() {
        let mut input = Vec::new();
        for _ in 0..100_000 {
            input.extend_from_slice(b"*1\r\n");
        }
        let result = parse_message(&input);
        assert_eq!(
            result,
            Err(ParseError::MaxDepthExceeded {
                max: MAX_NESTING_DEPTH
            })
        );
    }

    #[test]
    fn test_unknown_prefix() {
        let result = parse_message(b"@invalid\r\n");
        assert_eq!(result, Err(ParseError::UnknownPrefix(b'@')));
    }

    #[test]
    fn test_unknown_prefix_without_line_end() {
        let parser = RespParser::new();
        assert_eq!(parser.parse(b"@"), Err(ParseError::UnknownPrefix(b'@')));
        assert_eq!(parser.decode(b"!bad"), Err(ParseError::UnknownPrefix(b'!')));

        // Garbage after a complete array element is caught on its first byte too
        assert_eq!(
            parser.parse(b"*2\r\n:1\r\n?"),
            Err(ParseError::UnknownPrefix(b'?'))
        );
    }

    #[test]
    fn test_signed_lengths_are_rejected() {
        assert!(matches!(
            parse_message(b"$+3\r\nfoo\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b"*+1\r\n:1\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b":+5\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b":-\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b":\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b": 5\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_partial_reports_needed_length() {
        let parser = RespParser::new();

        // Header complete, payload missing: the full frame length is known
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$100000\r\nabc";
        let header_end = input.len() - 3;
        assert_eq!(
            parser.parse_partial(input),
            Ok(ParseOutcome::Incomplete {
                needed: header_end + 100_000 + 2,
                payload: 3 + 1 + 100_000,
            })
        );

        // No line end yet: at least one more byte
        assert_eq!(
            parser.parse_partial(b"$100"),
            Ok(ParseOutcome::Incomplete {
                needed: 5,
                payload: 0
            })
        );
        assert_eq!(
            parser.parse_partial(b""),
            Ok(ParseOutcome::Incomplete {
                needed: 1,
                payload: 0
            })
        );

        // Finished payloads still count while the request is incomplete
        assert_eq!(
            parser.parse_partial(b"*2\r\n$5\r\nhello\r\n$"),
            Ok(ParseOutcome::Incomplete {
                needed: 17,
                payload: 5
            })
        );

        assert_eq!(
            parser.parse_partial(b"+OK\r\n"),
            Ok(ParseOutcome::Complete(RespValue::ok(), 5))
        );
    }

    #[test]
    fn test_pipelined_values() {
        let input = b"+OK\r\n$3\r\nfoo\r\n*1\r\n$4\r\nPING\r\n";
        let parser = RespParser::new();

        let (first, n1) = parser.parse(input).unwrap().unwrap();
        assert_eq!(first, RespValue::ok());

        let (second, n2) = parser.parse(&input[n1..]).unwrap().unwrap();
        assert_eq!(second, bulk("foo"));

        let (third, n3) = parser.parse(&input[n1 + n2..]).unwrap().unwrap();
        assert_eq!(third, RespValue::Array(vec![bulk("PING")]));
        assert_eq!(n1 + n2 + n3, input.len());
    }

    #[test]
    fn test_decode_empty_stream() {
        assert_eq!(RespParser::new().decode(b""), Err(ParseError::Truncated));
        assert!(ParseError::Truncated.is_truncation());
        assert!(!ParseError::UnknownPrefix(b'x').is_truncation());
    }

    #[test]
    fn test_roundtrip() {
        let values = vec![
            RespValue::simple_string("OK"),
            RespValue::error("ERR syntax error"),
            RespValue::integer(-7),
            bulk(""),
            RespValue::bulk_string(Bytes::from_static(b"\x00\r\n\xff")),
            RespValue::Null,
            RespValue::array(vec![]),
            RespValue::array(vec![
                bulk("SET"),
                bulk("key"),
                RespValue::array(vec![RespValue::Null, RespValue::integer(1)]),
            ]),
        ];

        for original in values {
            let encoded = original.serialize();
            let (decoded, consumed) = RespParser::new().decode(&encoded).unwrap();
            assert_eq!(decoded, original);
            assert_eq!(consumed, encoded.len());
        }
    }
}
