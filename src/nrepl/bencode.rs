//! Bencode framing for nREPL messages.
//!
//! nREPL's default transport writes one bencode dictionary per message and
//! concatenates messages on the stream without any separator:
//!
//! ```text
//! d2:id1:72:op4:eval4:code5:1 + 1e
//! ```
//!
//! | Type        | Encoding            |
//! |-------------|---------------------|
//! | integer     | `i<digits>e`        |
//! | byte string | `<len>:<bytes>`     |
//! | list        | `l<items>e`         |
//! | dictionary  | `d<key><value>...e` |
//!
//! Dictionary keys are byte strings sorted by their raw bytes. Because
//! messages are self-delimiting, the [`Decoder`] buffers input and yields a
//! message only once its closing `e` has arrived.

use std::collections::BTreeMap;

use crate::nrepl::error::ProtocolError;
use crate::nrepl::message::{Message, Value};

/// Maximum byte-string length (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Maximum list/dict nesting accepted from the wire.
const MAX_DEPTH: usize = 64;

/// Longest decimal `i64`, sign included.
const MAX_INT_CHARS: usize = 20;

/// Digits in the longest accepted byte-string length.
const MAX_LENGTH_DIGITS: usize = 10;

/// Encode a message as a bencode dictionary.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    encode_dict(msg.fields(), &mut out);
    out
}

/// Append the bencode form of `value` to `out`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(s) => encode_bytes(s.as_bytes(), out),
        Value::Bytes(b) => encode_bytes(b, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => encode_dict(map, out),
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn encode_dict(map: &BTreeMap<String, Value>, out: &mut Vec<u8>) {
    // BTreeMap<String, _> iterates in byte order, which is what bencode requires
    out.push(b'd');
    for (key, value) in map {
        encode_bytes(key.as_bytes(), out);
        encode_value(value, out);
    }
    out.push(b'e');
}

/// Decode exactly one message from `bytes`.
///
/// Trailing bytes or an incomplete message are errors here; use [`Decoder`]
/// for stream input.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let mut decoder = Decoder::new();
    decoder.push(bytes);
    let msg = decoder
        .next_message()?
        .ok_or_else(|| ProtocolError::CorruptFrame("Incomplete message".to_string()))?;
    if decoder.buffered() > 0 {
        return Err(ProtocolError::CorruptFrame(format!(
            "{} trailing bytes after message",
            decoder.buffered()
        )));
    }
    Ok(msg)
}

/// Incremental decoder for a stream of concatenated messages.
///
/// Feed raw socket reads with [`Decoder::push`] and drain complete messages
/// with [`Decoder::next_message`]. A message cut off at the end of the buffer
/// stays buffered until more bytes arrive.
///
/// Framing is found by a scan that remembers where it stopped, so a large
/// message delivered in many reads is walked once rather than once per read.
/// Only a token split by the end of the buffer is looked at again.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    /// Bytes before this offset belong to messages already returned.
    start: usize,
    /// First token of the current frame not yet scanned.
    scan_pos: usize,
    /// Lists and dicts opened in the current frame and not yet closed.
    depth: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scan_pos -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Pop the next complete message.
    ///
    /// # Errors
    ///
    /// Returns `CorruptFrame` if the buffered bytes can never form a valid
    /// message, and `UnexpectedType` if a complete top-level value is not a
    /// dictionary or has a non-UTF-8 key. After an error the decoder state is
    /// unspecified; the connection should be dropped.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(end) = self.scan_frame()? else {
            return Ok(None);
        };

        let mut parser = Parser {
            buf: &self.buf[self.start..end],
            pos: 0,
        };
        let value = parser
            .value(0)?
            .ok_or_else(|| ProtocolError::CorruptFrame("Truncated message".to_string()))?;
        self.start = end;

        match value {
            Value::Dict(fields) => Ok(Some(Message::from_fields(fields))),
            other => Err(ProtocolError::UnexpectedType {
                field: format!("message ({})", other.type_name()),
                expected: "dict",
            }),
        }
    }

    /// Advance over the complete tokens of the frame starting at `start`.
    ///
    /// Returns the end offset of the frame once its outermost value closes.
    fn scan_frame(&mut self) -> Result<Option<usize>, ProtocolError> {
        while let Some(&tag) = self.buf.get(self.scan_pos) {
            let token_end = match tag {
                b'l' | b'd' => {
                    if self.depth > MAX_DEPTH {
                        return Err(ProtocolError::CorruptFrame(format!(
                            "Nesting deeper than {} levels",
                            MAX_DEPTH
                        )));
                    }
                    self.depth += 1;
                    self.scan_pos += 1;
                    continue;
                }
                b'e' if self.depth > 0 => {
                    self.depth -= 1;
                    self.scan_pos + 1
                }
                b'i' => match scan_int(&self.buf, self.scan_pos)? {
                    Some(end) => end,
                    None => return Ok(None),
                },
                b'0'..=b'9' => match byte_string_header(&self.buf, self.scan_pos)? {
                    Some((len, body_start)) if self.buf.len() >= body_start + len => {
                        body_start + len
                    }
                    _ => return Ok(None),
                },
                other => {
                    return Err(ProtocolError::CorruptFrame(format!(
                        "Unexpected byte {:?} at offset {}",
                        other as char,
                        self.scan_pos - self.start
                    )))
                }
            };

            self.scan_pos = token_end;
            if self.depth == 0 {
                return Ok(Some(token_end));
            }
        }
        Ok(None)
    }
}

/// End offset of the `i...e` token at `pos`, or `None` if its `e` is missing.
fn scan_int(buf: &[u8], pos: usize) -> Result<Option<usize>, ProtocolError> {
    let body = &buf[pos + 1..];
    // Longest i64 is 20 chars including sign
    match body.iter().take(MAX_INT_CHARS + 1).position(|&b| b == b'e') {
        Some(len) => Ok(Some(pos + 1 + len + 1)),
        None if body.len() > MAX_INT_CHARS => Err(ProtocolError::CorruptFrame(
            "Unterminated integer".to_string(),
        )),
        None => Ok(None),
    }
}

/// Parse the `<len>:` prefix at `pos` into the length and the body offset.
fn byte_string_header(buf: &[u8], pos: usize) -> Result<Option<(usize, usize)>, ProtocolError> {
    let malformed = || ProtocolError::CorruptFrame("Malformed byte-string length".to_string());

    let window = &buf[pos..buf.len().min(pos + MAX_LENGTH_DIGITS + 1)];
    let Some(colon) = window.iter().position(|&b| b == b':') else {
        if window.iter().any(|b| !b.is_ascii_digit()) {
            return Err(malformed());
        }
        if window.len() > MAX_LENGTH_DIGITS {
            return Err(ProtocolError::CorruptFrame(
                "Byte-string length too long".to_string(),
            ));
        }
        return Ok(None);
    };

    let digits = &window[..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;

    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::CorruptFrame(format!(
            "Byte string of {} bytes exceeds maximum {} bytes",
            len, MAX_MESSAGE_SIZE
        )));
    }
    Ok(Some((len, pos + colon + 1)))
}

/// Recursive-descent parser over a borrowed buffer.
///
/// Every method returns `Ok(None)` when it runs out of input. The decoder
/// only hands it whole frames.
struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Result<Option<Value>, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::CorruptFrame(format!(
                "Nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }

        let Some(tag) = self.peek() else {
            return Ok(None);
        };

        match tag {
            b'i' => {
                self.pos += 1;
                self.int()
            }
            b'0'..=b'9' => Ok(self.bytes()?.map(Value::from_bytes)),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        None => return Ok(None),
                        Some(b'e') => {
                            self.pos += 1;
                            return Ok(Some(Value::List(items)));
                        }
                        Some(_) => match self.value(depth + 1)? {
                            Some(v) => items.push(v),
                            None => return Ok(None),
                        },
                    }
                }
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                loop {
                    match self.peek() {
                        None => return Ok(None),
                        Some(b'e') => {
                            self.pos += 1;
                            return Ok(Some(Value::Dict(map)));
                        }
                        Some(b'0'..=b'9') => {
                            let Some(raw_key) = self.bytes()? else {
                                return Ok(None);
                            };
                            let key = String::from_utf8(raw_key).map_err(|_| {
                                ProtocolError::UnexpectedType {
                                    field: "dict key".to_string(),
                                    expected: "UTF-8 string",
                                }
                            })?;
                            match self.value(depth + 1)? {
                                Some(v) => {
                                    map.insert(key, v);
                                }
                                None => return Ok(None),
                            }
                        }
                        Some(other) => {
                            return Err(ProtocolError::CorruptFrame(format!(
                                "Dictionary key must be a byte string, found {:?}",
                                other as char
                            )))
                        }
                    }
                }
            }
            other => Err(ProtocolError::CorruptFrame(format!(
                "Unexpected byte {:?} at offset {}",
                other as char, self.pos
            ))),
        }
    }

    /// Parse the body of `i...e` (the `i` is already consumed).
    fn int(&mut self) -> Result<Option<Value>, ProtocolError> {
        let start = self.pos;
        let Some(end) = scan_int(self.buf, start - 1)? else {
            return Ok(None);
        };

        let digits = std::str::from_utf8(&self.buf[start..end - 1])
            .map_err(|_| ProtocolError::CorruptFrame("Non-ASCII integer".to_string()))?;
        let valid = match digits.strip_prefix('-') {
            Some(rest) => !rest.is_empty() && !rest.starts_with('0'),
            None => digits == "0" || (!digits.is_empty() && !digits.starts_with('0')),
        };
        if !valid || !digits.bytes().skip(1).all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::CorruptFrame(format!(
                "Invalid integer {:?}",
                digits
            )));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| ProtocolError::CorruptFrame(format!("Invalid integer {:?}", digits)))?;

        self.pos = end;
        Ok(Some(Value::Int(value)))
    }

    /// Parse `<len>:<bytes>`.
    fn bytes(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some((len, body_start)) = byte_string_header(self.buf, self.pos)? else {
            return Ok(None);
        };
        if self.buf.len() < body_start + len {
            return Ok(None);
        }

        self.pos = body_start + len;
        Ok(Some(self.buf[body_start..self.pos].to_vec()))
    }
}
