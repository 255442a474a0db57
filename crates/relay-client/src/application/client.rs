//! `RelayClient`: the client-side API.
//!
//! Every request/response operation comes in two forms.  The `*_with` form
//! registers a continuation and returns as soon as the request is queued; the
//! async form awaits the same continuation through a oneshot channel.  Either
//! way the reply is routed by correlation id on the connection's inbound
//! worker, after the local status has been updated.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_core::protocol::messages::{
    DisconnectRequest, EndSessionRequest, EndSessionResponse, GenericResponse, Message,
    MessageBody, ResponseBody, SessionRequest, SessionResponse, TextMessageRequest,
    ValidationRequest, ValidationResponse, DEFAULT_FRAME_QUALITY, DEFAULT_UPLOAD_BUFFER_SIZE,
};
use relay_core::{
    CallbackError, Connection, ConnectionError, ConnectionOptions, EnvelopeError,
    EnvelopePayload, GenericEnvelope, Reply, Status, StatusError,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::application::dispatch::ClientDispatcher;
use crate::application::events::ClientEvent;
use crate::application::frame_stream::{self, FrameControl, FrameProvider, FrameStream};
use crate::application::transfer::{self, FileStore, UploadProgress, UploadStatus};

/// Errors returned by [`RelayClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("file error on {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The connection closed before the reply arrived.
    #[error("connection closed before a reply arrived")]
    Disconnected,

    /// The server or the session peer answered with an error.
    #[error("{0}")]
    Remote(String),
}

/// Collaborators the client answers peer requests with.
#[derive(Clone)]
pub struct ClientServices {
    pub files: Arc<dyn FileStore>,
    pub frames: Arc<dyn FrameProvider>,
}

impl ClientServices {
    pub fn new(files: Arc<dyn FileStore>, frames: Arc<dyn FrameProvider>) -> Self {
        Self { files, frames }
    }
}

/// Tunables for outgoing transfers and frame pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub upload_buffer_size: u32,
    pub frame_quality: u8,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            upload_buffer_size: DEFAULT_UPLOAD_BUFFER_SIZE,
            frame_quality: DEFAULT_FRAME_QUALITY,
        }
    }
}

/// Handle to one connection to a relay server.  Cloning is cheap.
#[derive(Clone)]
pub struct RelayClient {
    connection: Connection,
    files: Arc<dyn FileStore>,
    options: ClientOptions,
}

impl RelayClient {
    /// Starts a client over an already connected stream.
    pub fn open<S>(
        stream: S,
        services: ClientServices,
        options: ClientOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events, rx) = mpsc::unbounded_channel();
        let dispatcher =
            ClientDispatcher::new(Arc::clone(&services.files), services.frames, events);
        let connection = Connection::open(stream, ConnectionOptions::client(), Arc::new(dispatcher));
        let client = Self {
            connection,
            files: services.files,
            options,
        };
        (client, rx)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn status(&self) -> Status {
        self.connection.status()
    }

    pub fn options(&self) -> ClientOptions {
        self.options
    }

    // ── Login ─────────────────────────────────────────────────────────────────

    pub fn login_with<F>(&self, email: impl Into<String>, on_reply: F) -> Result<Uuid, ClientError>
    where
        F: FnOnce(Reply<ValidationResponse>) + Send + 'static,
    {
        self.request_with(ValidationRequest { email: email.into() }, on_reply)
    }

    /// Logs in as `email`.  On success the client is `Validated`.
    pub async fn login(&self, email: impl Into<String>) -> Result<(), ClientError> {
        let email = email.into();
        let reply = self
            .request::<ValidationResponse>(ValidationRequest {
                email: email.clone(),
            })
            .await?;
        if reply.has_error || !reply.body.is_valid {
            return Err(remote_error(&reply, "login refused"));
        }
        info!("logged in as {email}");
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn request_session_with<F>(
        &self,
        peer: impl Into<String>,
        on_reply: F,
    ) -> Result<Uuid, ClientError>
    where
        F: FnOnce(Reply<SessionResponse>) + Send + 'static,
    {
        self.request_with(SessionRequest { email: peer.into() }, on_reply)
    }

    /// Asks the server to pair us with `peer`.  Returns the peer's email once
    /// the session is confirmed; the client is then `InSession`.
    pub async fn request_session(&self, peer: impl Into<String>) -> Result<String, ClientError> {
        let reply = self
            .request::<SessionResponse>(SessionRequest { email: peer.into() })
            .await?;
        if reply.has_error || !reply.body.is_confirmed {
            return Err(remote_error(&reply, "session refused"));
        }
        Ok(reply.body.email)
    }

    pub fn end_session_with<F>(&self, on_reply: F) -> Result<Uuid, ClientError>
    where
        F: FnOnce(Reply<EndSessionResponse>) + Send + 'static,
    {
        self.request_with(EndSessionRequest, on_reply)
    }

    /// Ends the current session.  The client is `Validated` afterwards.
    pub async fn end_session(&self) -> Result<(), ClientError> {
        let reply = self.request::<EndSessionResponse>(EndSessionRequest).await?;
        if reply.has_error {
            return Err(remote_error(&reply, "could not end the session"));
        }
        Ok(())
    }

    // ── Relayed traffic ───────────────────────────────────────────────────────

    /// Sends text to the session peer.  Dropped by the server outside a
    /// session.
    pub fn send_text(&self, message: impl Into<String>) -> Result<(), ClientError> {
        self.connection.send(Message::new(TextMessageRequest {
            message: message.into(),
        }))?;
        Ok(())
    }

    /// Starts uploading `source` to the session peer.  `on_progress` runs once
    /// per echo from the peer and a final time with `Completed` or `Failed`.
    pub fn upload_file<F>(&self, source: impl AsRef<Path>, on_progress: F) -> Result<Uuid, ClientError>
    where
        F: FnMut(UploadProgress) + Send + 'static,
    {
        transfer::start_upload(
            &self.connection,
            Arc::clone(&self.files),
            source.as_ref(),
            self.options.upload_buffer_size,
            on_progress,
        )
    }

    /// Uploads `source` and waits for the transfer to finish.  Returns the
    /// number of bytes transferred.
    pub async fn upload(&self, source: impl AsRef<Path>) -> Result<u64, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.upload_file(source, move |progress| {
            if progress.status != UploadStatus::InProgress {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(progress);
                }
            }
        })?;

        let done = rx.await.map_err(|_| ClientError::Disconnected)?;
        match done.status {
            UploadStatus::Failed(error) => Err(ClientError::Remote(error)),
            _ => Ok(done.transferred),
        }
    }

    /// Starts pulling frames from the session peer.  `on_frame` receives each
    /// frame (or the peer's capture error) and decides whether to continue.
    pub fn request_frames<F>(&self, quality: u8, on_frame: F) -> Result<FrameStream, ClientError>
    where
        F: FnMut(Result<Vec<u8>, String>) -> FrameControl + Send + 'static,
    {
        frame_stream::start_frames(&self.connection, quality, on_frame)
    }

    /// [`request_frames`](Self::request_frames) at the configured quality.
    pub fn request_frames_default<F>(&self, on_frame: F) -> Result<FrameStream, ClientError>
    where
        F: FnMut(Result<Vec<u8>, String>) -> FrameControl + Send + 'static,
    {
        self.request_frames(self.options.frame_quality, on_frame)
    }

    // ── Generic envelope ──────────────────────────────────────────────────────

    /// Sends `request` to the session peer inside a generic envelope and hands
    /// the decoded `Resp` (or the failure) to `on_reply`.
    pub fn send_generic_request<Req, Resp, F>(&self, request: &Req, on_reply: F) -> Result<Uuid, ClientError>
    where
        Req: EnvelopePayload,
        Resp: EnvelopePayload,
        F: FnOnce(Result<Resp, ClientError>) + Send + 'static,
    {
        let envelope = GenericEnvelope::wrap(request)?;
        self.request_with::<GenericResponse, _>(envelope, move |reply| on_reply(open_generic(reply)))
    }

    /// Awaitable form of [`send_generic_request`](Self::send_generic_request).
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp, ClientError>
    where
        Req: EnvelopePayload,
        Resp: EnvelopePayload + Send + 'static,
    {
        let envelope = GenericEnvelope::wrap(request)?;
        let reply = self.request::<GenericResponse>(envelope).await?;
        open_generic(reply)
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Tells the server we are leaving, then closes once that notice is
    /// written.
    pub fn disconnect(&self) {
        if self.connection.send(Message::new(DisconnectRequest)).is_ok() {
            self.connection.close_after_flush();
        }
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    fn request_with<R, F>(&self, body: impl Into<MessageBody>, on_reply: F) -> Result<Uuid, ClientError>
    where
        R: ResponseBody,
        F: FnOnce(Reply<R>) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let mut on_reply = Some(on_reply);
        self.connection
            .callbacks()
            .register::<R, _>(id, move |_, reply| {
                if let Some(on_reply) = on_reply.take() {
                    on_reply(reply);
                }
            })?;
        if let Err(e) = self.connection.send(Message::with_correlation(id, body)) {
            self.connection.callbacks().remove(&id);
            return Err(e.into());
        }
        Ok(id)
    }

    async fn request<R: ResponseBody>(&self, body: impl Into<MessageBody>) -> Result<Reply<R>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.request_with::<R, _>(body, move |reply| {
            let _ = tx.send(reply);
        })?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("connection", &self.connection)
            .field("options", &self.options)
            .finish()
    }
}

fn remote_error<R>(reply: &Reply<R>, fallback: &str) -> ClientError {
    match reply.error.as_deref() {
        Some(error) if !error.is_empty() => ClientError::Remote(error.to_string()),
        _ => ClientError::Remote(fallback.to_string()),
    }
}

fn open_generic<Resp: EnvelopePayload>(reply: Reply<GenericResponse>) -> Result<Resp, ClientError> {
    if reply.has_error {
        return Err(remote_error(&reply, "generic request failed"));
    }
    Ok(reply.body.envelope.open::<Resp>()?)
}
