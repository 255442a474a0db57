//! Binary codec for encoding and decoding Relay Sessions messages.
//!
//! Wire format:
//! ```text
//! [version:1][flags:1][name_len:2][payload_len:4][seq:8][timestamp_us:8]
//! [type_name:name_len][payload:payload_len]
//! ```
//! The fixed header is 24 bytes.  All multi-byte integers are big-endian.
//!
//! The payload starts with the fields every message shares:
//! ```text
//! [correlation_id:16][has_error:1][error_present:1]([error_len:4][error:N])?
//! ```
//! followed by the variant fields.  Strings and byte blobs are prefixed with a
//! 4-byte length.
//!
//! Compatibility rules for peers built from different revisions:
//! - the variant is chosen by its stable type name, not by a numeric code;
//! - any version at or above [`MIN_SUPPORTED_VERSION`] is decoded;
//! - bytes after the last known field of a payload are ignored, so newer
//!   revisions may append fields.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::envelope::GenericEnvelope;
use crate::protocol::messages::{
    EndSessionRequest, EndSessionResponse, FileUploadRequest, FileUploadResponse, GenericResponse,
    Message, MessageBody, MessageKind, RemoteFrameRequest, RemoteFrameResponse, SessionRequest,
    SessionResponse, TextMessageRequest, ValidationRequest, ValidationResponse, DisconnectRequest,
    HEADER_SIZE, MAX_PAYLOAD_LEN, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice does not yet hold a complete frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The type name in the frame is not known to this build.
    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),

    /// The protocol version in the header is older than this build supports.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed (truncated field, invalid UTF-8, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The declared payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("frame too large: payload of {declared} bytes exceeds limit of {limit}")]
    FrameTooLarge { declared: usize, limit: usize },
}

impl ProtocolError {
    /// Returns `true` when the frame boundaries are still trustworthy, so a
    /// reader can drop this frame and carry on with the next one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownMessageType(_) | ProtocolError::MalformedPayload(_)
        )
    }
}

/// Decoded fixed header of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub name_len: usize,
    pub payload_len: usize,
    pub sequence_number: u64,
    pub timestamp_us: u64,
}

impl FrameHeader {
    /// Total size of the frame, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.name_len + self.payload_len
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into a complete frame.
///
/// The sequence number is only informational; the connection stamps each
/// outgoing frame from its own counter.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_LEN`].
///
/// # Examples
///
/// ```rust
/// use relay_core::protocol::{decode_message, encode_message};
/// use relay_core::protocol::messages::{Message, TextMessageRequest};
///
/// let msg = Message::new(TextMessageRequest { message: "hi".to_string() });
/// let bytes = encode_message(&msg, 0, 0).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    msg: &Message,
    sequence_number: u64,
    timestamp_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let name = msg.kind().name().as_bytes();
    let payload = encode_payload(msg);
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FrameTooLarge {
            declared: payload.len(),
            limit: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + name.len() + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(0x00); // flags, reserved
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encodes a [`Message`] using the current system time as the timestamp.
///
/// # Errors
///
/// See [`encode_message`].
pub fn encode_message_now(msg: &Message, sequence_number: u64) -> Result<Vec<u8>, ProtocolError> {
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    encode_message(msg, sequence_number, timestamp_us)
}

/// Reads the fixed header at the start of `bytes`.
///
/// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are available.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedVersion`] or
/// [`ProtocolError::FrameTooLarge`] when the header itself cannot be trusted.
pub fn peek_frame_header(bytes: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }

    let version = bytes[0];
    if version < MIN_SUPPORTED_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let name_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FrameTooLarge {
            declared: payload_len,
            limit: MAX_PAYLOAD_LEN,
        });
    }

    Ok(Some(FrameHeader {
        version,
        flags: bytes[1],
        name_len,
        payload_len,
        sequence_number: read_u64_at(bytes, 8),
        timestamp_us: read_u64_at(bytes, 16),
    }))
}

/// Decodes one [`Message`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed, so the
/// caller can advance its read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] until a whole frame is
/// available, and the other variants for frames that cannot be decoded.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let header = peek_frame_header(bytes)?.ok_or(ProtocolError::InsufficientData {
        needed: HEADER_SIZE,
        available: bytes.len(),
    })?;

    let frame_len = header.frame_len();
    if bytes.len() < frame_len {
        return Err(ProtocolError::InsufficientData {
            needed: frame_len,
            available: bytes.len(),
        });
    }

    let name_end = HEADER_SIZE + header.name_len;
    let name = std::str::from_utf8(&bytes[HEADER_SIZE..name_end])
        .map_err(|e| ProtocolError::MalformedPayload(format!("type name is not UTF-8: {e}")))?;
    let kind = MessageKind::from_name(name)
        .ok_or_else(|| ProtocolError::UnknownMessageType(name.to_string()))?;

    let message = decode_payload(kind, &bytes[name_end..frame_len])?;
    Ok((message, frame_len))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut w = PayloadWriter::default();
    w.uuid(&msg.correlation_id);
    w.bool(msg.has_error);
    w.opt_string(msg.error.as_deref());

    match &msg.body {
        MessageBody::ValidationRequest(m) => w.string(&m.email),
        MessageBody::ValidationResponse(m) => {
            w.bool(m.delete_callback_on_receipt);
            w.bool(m.is_valid);
        }
        MessageBody::SessionRequest(m) => w.string(&m.email),
        MessageBody::SessionResponse(m) => {
            w.bool(m.delete_callback_on_receipt);
            w.bool(m.is_confirmed);
            w.string(&m.email);
        }
        MessageBody::EndSessionRequest(_) | MessageBody::DisconnectRequest(_) => {}
        MessageBody::EndSessionResponse(m) => w.bool(m.delete_callback_on_receipt),
        MessageBody::TextMessageRequest(m) => w.string(&m.message),
        MessageBody::FileUploadRequest(m) => {
            w.string(&m.file_name);
            w.u64(m.total_bytes);
            w.u64(m.current_position);
            w.string(&m.source_path);
            w.string(&m.destination_path);
            w.u32(m.buffer_size);
            w.bytes(&m.bytes_to_write);
        }
        MessageBody::FileUploadResponse(m) => {
            w.bool(m.delete_callback_on_receipt);
            w.string(&m.file_name);
            w.u64(m.total_bytes);
            w.u64(m.current_position);
            w.string(&m.source_path);
            w.string(&m.destination_path);
        }
        MessageBody::RemoteFrameRequest(m) => w.u8(m.quality),
        MessageBody::RemoteFrameResponse(m) => {
            w.bool(m.delete_callback_on_receipt);
            w.bool(m.cancel);
            w.bytes(&m.frame);
        }
        MessageBody::GenericRequest(envelope) => w.envelope(envelope),
        MessageBody::GenericResponse(m) => {
            w.bool(m.delete_callback_on_receipt);
            w.envelope(&m.envelope);
        }
    }
    w.buf
}

#[derive(Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn uuid(&mut self, v: &Uuid) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    fn opt_string(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.bool(true);
                self.string(s);
            }
            None => self.bool(false),
        }
    }

    fn envelope(&mut self, v: &GenericEnvelope) {
        self.string(&v.type_name);
        self.bytes(&v.payload);
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut r = PayloadReader::new(payload, kind);
    let correlation_id = r.uuid()?;
    let has_error = r.bool()?;
    let error = r.opt_string()?;

    let body = match kind {
        MessageKind::ValidationRequest => MessageBody::ValidationRequest(ValidationRequest {
            email: r.string()?,
        }),
        MessageKind::ValidationResponse => MessageBody::ValidationResponse(ValidationResponse {
            delete_callback_on_receipt: r.bool()?,
            is_valid: r.bool()?,
        }),
        MessageKind::SessionRequest => MessageBody::SessionRequest(SessionRequest {
            email: r.string()?,
        }),
        MessageKind::SessionResponse => MessageBody::SessionResponse(SessionResponse {
            delete_callback_on_receipt: r.bool()?,
            is_confirmed: r.bool()?,
            email: r.string()?,
        }),
        MessageKind::EndSessionRequest => MessageBody::EndSessionRequest(EndSessionRequest),
        MessageKind::EndSessionResponse => MessageBody::EndSessionResponse(EndSessionResponse {
            delete_callback_on_receipt: r.bool()?,
        }),
        MessageKind::DisconnectRequest => MessageBody::DisconnectRequest(DisconnectRequest),
        MessageKind::TextMessageRequest => MessageBody::TextMessageRequest(TextMessageRequest {
            message: r.string()?,
        }),
        MessageKind::FileUploadRequest => MessageBody::FileUploadRequest(FileUploadRequest {
            file_name: r.string()?,
            total_bytes: r.u64()?,
            current_position: r.u64()?,
            source_path: r.string()?,
            destination_path: r.string()?,
            buffer_size: r.u32()?,
            bytes_to_write: r.bytes()?,
        }),
        MessageKind::FileUploadResponse => MessageBody::FileUploadResponse(FileUploadResponse {
            delete_callback_on_receipt: r.bool()?,
            file_name: r.string()?,
            total_bytes: r.u64()?,
            current_position: r.u64()?,
            source_path: r.string()?,
            destination_path: r.string()?,
        }),
        MessageKind::RemoteFrameRequest => MessageBody::RemoteFrameRequest(RemoteFrameRequest {
            quality: r.u8()?,
        }),
        MessageKind::RemoteFrameResponse => MessageBody::RemoteFrameResponse(RemoteFrameResponse {
            delete_callback_on_receipt: r.bool()?,
            cancel: r.bool()?,
            frame: r.bytes()?,
        }),
        MessageKind::GenericRequest => MessageBody::GenericRequest(r.envelope()?),
        MessageKind::GenericResponse => MessageBody::GenericResponse(GenericResponse {
            delete_callback_on_receipt: r.bool()?,
            envelope: r.envelope()?,
        }),
    };

    Ok(Message {
        correlation_id,
        has_error,
        error,
        body,
    })
}

/// Sequential reader over one payload.  Every read checks bounds and names the
/// message kind in its error.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: MessageKind,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8], kind: MessageKind) -> Self {
        Self { buf, pos: 0, kind }
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(ProtocolError::MalformedPayload(format!(
                "{}: {field} needs {len} bytes at offset {}, payload is {} bytes",
                self.kind,
                self.pos,
                self.buf.len()
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1, "u8")?[0])
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.take(1, "bool")?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::MalformedPayload(format!(
                "{}: invalid bool byte 0x{other:02X}",
                self.kind
            ))),
        }
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8, "u64")?;
        Ok(read_u64_at(b, 0))
    }

    fn uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let b = self.take(16, "uuid")?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(Uuid::from_bytes(arr))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32()? as usize;
        Ok(self.take(len, "byte blob")?.to_vec())
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let raw = self.take(len, "string")?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|e| ProtocolError::MalformedPayload(format!("{}: invalid UTF-8: {e}", self.kind)))
    }

    fn opt_string(&mut self) -> Result<Option<String>, ProtocolError> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    fn envelope(&mut self) -> Result<GenericEnvelope, ProtocolError> {
        Ok(GenericEnvelope {
            type_name: self.string()?,
            payload: self.bytes()?,
        })
    }
}

fn read_u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(arr)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
