//! All Relay Sessions message types.
//!
//! Every wire unit is a [`Message`]: a small common header (correlation id and
//! error slot) wrapped around one [`MessageBody`] variant.  Variants are
//! identified on the wire by their stable type name (see [`MessageKind::name`]),
//! never by a build-specific numeric code, so peers built from different
//! revisions of the same schema can still talk to each other.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::envelope::GenericEnvelope;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version byte written by this build.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Oldest protocol version this build can decode.
pub const MIN_SUPPORTED_VERSION: u8 = 0x01;

/// Total size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload accepted by the decoder (64 MiB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Default chunk size for file uploads.
pub const DEFAULT_UPLOAD_BUFFER_SIZE: u32 = 1024;

/// Default quality requested for remote frames.
pub const DEFAULT_FRAME_QUALITY: u8 = 50;

// ── Message kinds ─────────────────────────────────────────────────────────────

/// Discriminant of every [`MessageBody`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ValidationRequest,
    ValidationResponse,
    SessionRequest,
    SessionResponse,
    EndSessionRequest,
    EndSessionResponse,
    DisconnectRequest,
    TextMessageRequest,
    FileUploadRequest,
    FileUploadResponse,
    RemoteFrameRequest,
    RemoteFrameResponse,
    GenericRequest,
    GenericResponse,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 14] = [
        MessageKind::ValidationRequest,
        MessageKind::ValidationResponse,
        MessageKind::SessionRequest,
        MessageKind::SessionResponse,
        MessageKind::EndSessionRequest,
        MessageKind::EndSessionResponse,
        MessageKind::DisconnectRequest,
        MessageKind::TextMessageRequest,
        MessageKind::FileUploadRequest,
        MessageKind::FileUploadResponse,
        MessageKind::RemoteFrameRequest,
        MessageKind::RemoteFrameResponse,
        MessageKind::GenericRequest,
        MessageKind::GenericResponse,
    ];

    /// Stable type name written into every frame header.
    ///
    /// These strings are part of the wire contract: renaming a Rust type must
    /// never change them.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::ValidationRequest => "ValidationRequest",
            MessageKind::ValidationResponse => "ValidationResponse",
            MessageKind::SessionRequest => "SessionRequest",
            MessageKind::SessionResponse => "SessionResponse",
            MessageKind::EndSessionRequest => "EndSessionRequest",
            MessageKind::EndSessionResponse => "EndSessionResponse",
            MessageKind::DisconnectRequest => "DisconnectRequest",
            MessageKind::TextMessageRequest => "TextMessageRequest",
            MessageKind::FileUploadRequest => "FileUploadRequest",
            MessageKind::FileUploadResponse => "FileUploadResponse",
            MessageKind::RemoteFrameRequest => "RemoteFrameRequest",
            MessageKind::RemoteFrameResponse => "RemoteFrameResponse",
            MessageKind::GenericRequest => "GenericRequest",
            MessageKind::GenericResponse => "GenericResponse",
        }
    }

    /// Resolves a stable type name back to its kind.
    pub fn from_name(name: &str) -> Option<MessageKind> {
        MessageKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Returns `true` for the response half of a request/response pair.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::ValidationResponse
                | MessageKind::SessionResponse
                | MessageKind::EndSessionResponse
                | MessageKind::FileUploadResponse
                | MessageKind::RemoteFrameResponse
                | MessageKind::GenericResponse
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Login and session control ─────────────────────────────────────────────────

/// Client → server: log in under the given email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub email: String,
}

/// Server → client: result of a [`ValidationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub is_valid: bool,
    pub delete_callback_on_receipt: bool,
}

impl ValidationResponse {
    pub fn new(is_valid: bool) -> Self {
        Self {
            is_valid,
            delete_callback_on_receipt: true,
        }
    }
}

/// Asks for a session with another endpoint.
///
/// On the way to the server `email` names the target; the server rewrites it
/// to the requester's email before forwarding it to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub email: String,
}

/// Answer to a [`SessionRequest`].
///
/// Sent by the target with `email` naming the requester; the server rewrites
/// it to the target's email before forwarding it to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub is_confirmed: bool,
    pub email: String,
    pub delete_callback_on_receipt: bool,
}

impl SessionResponse {
    pub fn new(is_confirmed: bool, email: impl Into<String>) -> Self {
        Self {
            is_confirmed,
            email: email.into(),
            delete_callback_on_receipt: true,
        }
    }
}

/// Ends the current session.  Also sent by the server as an out-of-band notice
/// to the peer of the endpoint that ended it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionRequest;

/// Acknowledges an [`EndSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub delete_callback_on_receipt: bool,
}

impl Default for EndSessionResponse {
    fn default() -> Self {
        Self {
            delete_callback_on_receipt: true,
        }
    }
}

/// Announces that the sender is going away.  The server forwards a fresh one
/// to the sender's peer, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest;

/// Free-form text relayed to the session peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessageRequest {
    pub message: String,
}

// ── File transfer ─────────────────────────────────────────────────────────────

/// One step of a chunked upload.
///
/// The first request of a transfer has `current_position == 0` and no bytes;
/// it only proposes the file to the receiver.  Every later request carries the
/// chunk that starts at `current_position - buffer_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadRequest {
    /// File name shown to the receiver (no directory part).
    pub file_name: String,
    pub total_bytes: u64,
    pub current_position: u64,
    /// Opaque path token on the sending side.
    pub source_path: String,
    /// Opaque path token on the receiving side, empty until accepted.
    pub destination_path: String,
    pub buffer_size: u32,
    pub bytes_to_write: Vec<u8>,
}

impl FileUploadRequest {
    /// Builds the opening request of a transfer.
    pub fn offer(
        file_name: impl Into<String>,
        source_path: impl Into<String>,
        total_bytes: u64,
        buffer_size: u32,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            total_bytes,
            current_position: 0,
            source_path: source_path.into(),
            destination_path: String::new(),
            buffer_size,
            bytes_to_write: Vec::new(),
        }
    }

    /// Builds the next chunk request from the receiver's last echo.
    ///
    /// `current_position` is advanced by exactly `buffer_size`, even when the
    /// final chunk is shorter.
    pub fn next_chunk(echo: &FileUploadResponse, bytes: Vec<u8>, buffer_size: u32) -> Self {
        Self {
            file_name: echo.file_name.clone(),
            total_bytes: echo.total_bytes,
            current_position: echo.current_position + u64::from(buffer_size),
            source_path: echo.source_path.clone(),
            destination_path: echo.destination_path.clone(),
            buffer_size,
            bytes_to_write: bytes,
        }
    }
}

/// Receiver's echo for each [`FileUploadRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadResponse {
    pub file_name: String,
    pub total_bytes: u64,
    pub current_position: u64,
    pub source_path: String,
    pub destination_path: String,
    pub delete_callback_on_receipt: bool,
}

impl FileUploadResponse {
    /// Echoes the transfer state of `request`.  The sender's continuation stays
    /// registered for the whole transfer.
    pub fn echo(request: &FileUploadRequest) -> Self {
        Self {
            file_name: request.file_name.clone(),
            total_bytes: request.total_bytes,
            current_position: request.current_position,
            source_path: request.source_path.clone(),
            destination_path: request.destination_path.clone(),
            delete_callback_on_receipt: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_position >= self.total_bytes
    }
}

// ── Frame streaming ───────────────────────────────────────────────────────────

/// Pull request for one encoded screen frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFrameRequest {
    /// Encoder quality, 0–100.
    pub quality: u8,
}

impl Default for RemoteFrameRequest {
    fn default() -> Self {
        Self {
            quality: DEFAULT_FRAME_QUALITY,
        }
    }
}

/// One encoded frame, or the terminal marker of a cancelled stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFrameResponse {
    pub frame: Vec<u8>,
    pub cancel: bool,
    pub delete_callback_on_receipt: bool,
}

impl RemoteFrameResponse {
    pub fn frame(frame: Vec<u8>) -> Self {
        Self {
            frame,
            cancel: false,
            delete_callback_on_receipt: false,
        }
    }

    /// Terminal response sent by the requester when it stops pulling.
    pub fn cancelled() -> Self {
        Self {
            frame: Vec::new(),
            cancel: true,
            delete_callback_on_receipt: true,
        }
    }
}

// ── Generic envelope ──────────────────────────────────────────────────────────

/// Response half of a generic envelope exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResponse {
    pub envelope: GenericEnvelope,
    pub delete_callback_on_receipt: bool,
}

impl GenericResponse {
    pub fn new(envelope: GenericEnvelope) -> Self {
        Self {
            envelope,
            delete_callback_on_receipt: true,
        }
    }
}

// ── Top-level message ─────────────────────────────────────────────────────────

/// Closed set of message variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    ValidationRequest(ValidationRequest),
    ValidationResponse(ValidationResponse),
    SessionRequest(SessionRequest),
    SessionResponse(SessionResponse),
    EndSessionRequest(EndSessionRequest),
    EndSessionResponse(EndSessionResponse),
    DisconnectRequest(DisconnectRequest),
    TextMessageRequest(TextMessageRequest),
    FileUploadRequest(FileUploadRequest),
    FileUploadResponse(FileUploadResponse),
    RemoteFrameRequest(RemoteFrameRequest),
    RemoteFrameResponse(RemoteFrameResponse),
    GenericRequest(GenericEnvelope),
    GenericResponse(GenericResponse),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::ValidationRequest(_) => MessageKind::ValidationRequest,
            MessageBody::ValidationResponse(_) => MessageKind::ValidationResponse,
            MessageBody::SessionRequest(_) => MessageKind::SessionRequest,
            MessageBody::SessionResponse(_) => MessageKind::SessionResponse,
            MessageBody::EndSessionRequest(_) => MessageKind::EndSessionRequest,
            MessageBody::EndSessionResponse(_) => MessageKind::EndSessionResponse,
            MessageBody::DisconnectRequest(_) => MessageKind::DisconnectRequest,
            MessageBody::TextMessageRequest(_) => MessageKind::TextMessageRequest,
            MessageBody::FileUploadRequest(_) => MessageKind::FileUploadRequest,
            MessageBody::FileUploadResponse(_) => MessageKind::FileUploadResponse,
            MessageBody::RemoteFrameRequest(_) => MessageKind::RemoteFrameRequest,
            MessageBody::RemoteFrameResponse(_) => MessageKind::RemoteFrameResponse,
            MessageBody::GenericRequest(_) => MessageKind::GenericRequest,
            MessageBody::GenericResponse(_) => MessageKind::GenericResponse,
        }
    }

    /// `Some(flag)` for response variants, `None` for requests.
    pub fn delete_callback_on_receipt(&self) -> Option<bool> {
        match self {
            MessageBody::ValidationResponse(r) => Some(r.delete_callback_on_receipt),
            MessageBody::SessionResponse(r) => Some(r.delete_callback_on_receipt),
            MessageBody::EndSessionResponse(r) => Some(r.delete_callback_on_receipt),
            MessageBody::FileUploadResponse(r) => Some(r.delete_callback_on_receipt),
            MessageBody::RemoteFrameResponse(r) => Some(r.delete_callback_on_receipt),
            MessageBody::GenericResponse(r) => Some(r.delete_callback_on_receipt),
            MessageBody::ValidationRequest(_)
            | MessageBody::SessionRequest(_)
            | MessageBody::EndSessionRequest(_)
            | MessageBody::DisconnectRequest(_)
            | MessageBody::TextMessageRequest(_)
            | MessageBody::FileUploadRequest(_)
            | MessageBody::RemoteFrameRequest(_)
            | MessageBody::GenericRequest(_) => None,
        }
    }
}

macro_rules! impl_into_body {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for MessageBody {
                fn from(body: $ty) -> Self {
                    MessageBody::$variant(body)
                }
            }
        )*
    };
}

impl_into_body! {
    ValidationRequest => ValidationRequest,
    ValidationResponse => ValidationResponse,
    SessionRequest => SessionRequest,
    SessionResponse => SessionResponse,
    EndSessionRequest => EndSessionRequest,
    EndSessionResponse => EndSessionResponse,
    DisconnectRequest => DisconnectRequest,
    TextMessageRequest => TextMessageRequest,
    FileUploadRequest => FileUploadRequest,
    FileUploadResponse => FileUploadResponse,
    RemoteFrameRequest => RemoteFrameRequest,
    RemoteFrameResponse => RemoteFrameResponse,
    GenericRequest => GenericEnvelope,
    GenericResponse => GenericResponse,
}

/// A complete wire unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Links a response to its request.  [`Uuid::nil`] means "no correlation".
    pub correlation_id: Uuid,
    pub has_error: bool,
    pub error: Option<String>,
    pub body: MessageBody,
}

impl Message {
    /// Uncorrelated message, used for notices such as a propagated
    /// [`DisconnectRequest`].
    pub fn new(body: impl Into<MessageBody>) -> Self {
        Self::with_correlation(Uuid::nil(), body)
    }

    pub fn with_correlation(correlation_id: Uuid, body: impl Into<MessageBody>) -> Self {
        Self {
            correlation_id,
            has_error: false,
            error: None,
            body: body.into(),
        }
    }

    /// Response to `request`, carrying the same correlation id.
    pub fn reply_to(request: &Message, body: impl Into<MessageBody>) -> Self {
        Self::with_correlation(request.correlation_id, body)
    }

    /// Marks the message as an error response.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.has_error = true;
        self.error = Some(error.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_response(&self) -> bool {
        self.kind().is_response()
    }

    pub fn is_correlated(&self) -> bool {
        !self.correlation_id.is_nil()
    }
}

// ── Typed response extraction ─────────────────────────────────────────────────

/// A response variant that a continuation can be registered for.
///
/// `extract` hands the body back unchanged when it holds a different variant,
/// so a mismatched response can still be logged.
pub trait ResponseBody: Sized + Send + 'static {
    const KIND: MessageKind;

    fn extract(body: MessageBody) -> Result<Self, MessageBody>;
}

macro_rules! impl_response_body {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl ResponseBody for $ty {
                const KIND: MessageKind = MessageKind::$variant;

                fn extract(body: MessageBody) -> Result<Self, MessageBody> {
                    match body {
                        MessageBody::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_response_body! {
    ValidationResponse => ValidationResponse,
    SessionResponse => SessionResponse,
    EndSessionResponse => EndSessionResponse,
    FileUploadResponse => FileUploadResponse,
    RemoteFrameResponse => RemoteFrameResponse,
    GenericResponse => GenericResponse,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
