//! Binary frame model and codec for the tunnel wire protocol.
//!
//! This crate owns the wire representation shared by the tunnel server and
//! the agent. Each frame travels as exactly one WebSocket binary message, so
//! the message boundary delimits the frame and Data payloads carry no length
//! prefix of their own.
//!
//! LAYOUT
//! ======
//! ```text
//! +-------------------+--------+----------------------------------+
//! | conn id (u64 BE)  | type   | payload                          |
//! | 8 bytes           | 1 byte | type specific                    |
//! +-------------------+--------+----------------------------------+
//!
//! Connect (0): varint len, proto | varint len, address | u64 BE deadline ms
//! Data    (1): raw bytes to the end of the message
//! Error   (2): varint len, UTF-8 message
//! Close   (3): varint len, UTF-8 message (an empty payload is also accepted)
//! ```
//!
//! Varints are protobuf-style unsigned LEB128, encoded with `prost`.

use bytes::{Buf, BufMut, Bytes};

/// Default cap on any declared length or Data payload, in bytes.
pub const DEFAULT_MAX_PAYLOAD: usize = 8192;

/// Size of the fixed frame header (connection ID + type tag).
pub const HEADER_LEN: usize = 9;

/// Error returned by [`decode_frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The message ended before a complete field could be read.
    #[error("truncated frame: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    /// The type tag does not map to a known [`FrameType`].
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
    /// A declared length or Data payload exceeds the configured cap.
    #[error("declared length {len} exceeds limit {max}")]
    Oversized { len: u64, max: usize },
    /// A varint length prefix is malformed.
    #[error("invalid varint length prefix")]
    InvalidVarint,
    /// A string field is not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    /// Bytes remain after a length-prefixed payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Wire type tag of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0,
    Data = 1,
    Error = 2,
    Close = 3,
}

impl FrameType {
    /// Parse a frame type from its wire tag.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownType`] for tags outside `0..=3`.
    pub fn from_u8(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Data),
            2 => Ok(Self::Error),
            3 => Ok(Self::Close),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Dial request carried by a Connect frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Network name, e.g. `"tcp"` or `"unix"`.
    pub proto: String,
    /// Address to dial on the far side.
    pub address: String,
    /// Dial deadline in milliseconds; `0` means "use the receiver's default".
    pub deadline_ms: u64,
}

/// Typed frame body. The tag on the wire is derived from the variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Connect(ConnectRequest),
    Data(Bytes),
    Error(String),
    Close(String),
}

impl Body {
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Connect(_) => FrameType::Connect,
            Self::Data(_) => FrameType::Data,
            Self::Error(_) => FrameType::Error,
            Self::Close(_) => FrameType::Close,
        }
    }
}

/// A single message on the tunnel wire protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Virtual connection this frame belongs to.
    pub conn_id: u64,
    pub body: Body,
}

impl Frame {
    #[must_use]
    pub fn connect(conn_id: u64, proto: impl Into<String>, address: impl Into<String>, deadline_ms: u64) -> Self {
        Self {
            conn_id,
            body: Body::Connect(ConnectRequest { proto: proto.into(), address: address.into(), deadline_ms }),
        }
    }

    #[must_use]
    pub fn data(conn_id: u64, payload: impl Into<Bytes>) -> Self {
        Self { conn_id, body: Body::Data(payload.into()) }
    }

    #[must_use]
    pub fn error(conn_id: u64, message: impl Into<String>) -> Self {
        Self { conn_id, body: Body::Error(message.into()) }
    }

    /// Error frame whose message is cut to at most `max_len` bytes, so it
    /// stays within a receiver's declared-length limit.
    #[must_use]
    pub fn error_within(conn_id: u64, message: &str, max_len: usize) -> Self {
        Self::error(conn_id, truncate_message(message, max_len))
    }

    #[must_use]
    pub fn close(conn_id: u64) -> Self {
        Self { conn_id, body: Body::Close(String::new()) }
    }

    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }
}

/// Longest prefix of `message` that fits in `max_len` bytes without
/// splitting a UTF-8 character.
#[must_use]
pub fn truncate_message(message: &str, max_len: usize) -> &str {
    if message.len() <= max_len {
        return message;
    }
    let mut end = max_len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Encode a frame into its binary wire form.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body_len_hint(&frame.body));
    out.put_u64(frame.conn_id);
    out.put_u8(frame.frame_type().as_u8());

    match &frame.body {
        Body::Connect(req) => {
            put_string(&mut out, &req.proto);
            put_string(&mut out, &req.address);
            out.put_u64(req.deadline_ms);
        }
        Body::Data(payload) => out.put_slice(payload),
        Body::Error(message) | Body::Close(message) => put_string(&mut out, message),
    }
    out
}

/// Decode one binary message into a frame.
///
/// `max_payload` caps every declared string length and the Data payload so a
/// hostile peer cannot make the receiver allocate unbounded buffers.
///
/// # Errors
///
/// Returns a [`CodecError`] for truncated input, unknown type tags, oversized
/// or malformed lengths, invalid UTF-8 and trailing bytes.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated { offset: 0, needed: HEADER_LEN - bytes.len() });
    }

    let mut cursor = Cursor { buf: bytes, offset: 0 };
    let conn_id = cursor.get_u64()?;
    let frame_type = FrameType::from_u8(cursor.get_u8()?)?;

    let body = match frame_type {
        FrameType::Connect => {
            let proto = cursor.get_string("proto", max_payload)?;
            let address = cursor.get_string("address", max_payload)?;
            let deadline_ms = cursor.get_u64()?;
            cursor.finish()?;
            Body::Connect(ConnectRequest { proto, address, deadline_ms })
        }
        FrameType::Data => {
            let payload = cursor.rest();
            if payload.len() > max_payload {
                return Err(CodecError::Oversized { len: payload.len() as u64, max: max_payload });
            }
            Body::Data(Bytes::copy_from_slice(payload))
        }
        FrameType::Error => {
            let message = cursor.get_string("error message", max_payload)?;
            cursor.finish()?;
            Body::Error(message)
        }
        FrameType::Close => {
            let message = if cursor.is_empty() { String::new() } else { cursor.get_string("close message", max_payload)? };
            cursor.finish()?;
            Body::Close(message)
        }
    };

    Ok(Frame { conn_id, body })
}

fn body_len_hint(body: &Body) -> usize {
    match body {
        Body::Connect(req) => req.proto.len() + req.address.len() + 20,
        Body::Data(payload) => payload.len(),
        Body::Error(message) | Body::Close(message) => message.len() + 10,
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    prost::encoding::encode_varint(value.len() as u64, out);
    out.put_slice(value.as_bytes());
}

/// Bounds-checked reader over one message.
struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }

    fn is_empty(&self) -> bool {
        self.offset == self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if remaining.len() < len {
            return Err(CodecError::Truncated { offset: self.offset, needed: len - remaining.len() });
        }
        self.offset += len;
        Ok(&remaining[..len])
    }

    fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn get_u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = self.take(8)?;
        Ok(raw.get_u64())
    }

    fn get_varint(&mut self) -> Result<u64, CodecError> {
        let mut remaining = self.remaining();
        if remaining.is_empty() {
            return Err(CodecError::Truncated { offset: self.offset, needed: 1 });
        }
        let before = remaining.len();
        let value = prost::encoding::decode_varint(&mut remaining).map_err(|_| CodecError::InvalidVarint)?;
        self.offset += before - remaining.len();
        Ok(value)
    }

    fn get_string(&mut self, field: &'static str, max_payload: usize) -> Result<String, CodecError> {
        let len = self.get_varint()?;
        if len > max_payload as u64 {
            return Err(CodecError::Oversized { len, max: max_payload });
        }
        // `len <= max_payload` so the cast cannot truncate.
        #[allow(clippy::cast_possible_truncation)]
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = self.remaining();
        self.offset = self.buf.len();
        rest
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.buf.len() - self.offset {
            0 => Ok(()),
            extra => Err(CodecError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
