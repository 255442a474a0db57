//! The connection engine shared by the client and the server.
//!
//! A [`Connection`] owns one byte stream and runs two tasks over it:
//!
//! - the **outbound worker** drains a FIFO queue, encodes each message and
//!   writes the whole frame before taking the next one;
//! - the **inbound worker** accumulates bytes, cuts them into frames and hands
//!   every decoded message to the connection's [`MessageHandler`].
//!
//! Both workers stop when the connection is closed, whichever side notices
//! first.  Closing is idempotent, and the handler's
//! [`on_disconnected`](MessageHandler::on_disconnected) runs exactly once, after
//! the inbound worker has stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::status::{Status, StatusError};
use crate::protocol::codec::{decode_message, encode_message_now, peek_frame_header};
use crate::protocol::messages::Message;
use crate::transport::callbacks::CallbackRegistry;

/// Size of each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Errors returned by [`Connection`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection has been closed; nothing more can be sent.
    #[error("connection {0} is closed")]
    Closed(Uuid),
}

/// Which side of the link a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// What the inbound worker does with a frame it cannot decode.
///
/// Only frames whose boundaries are intact are subject to this policy; a
/// corrupt header always closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedFramePolicy {
    /// Log the frame and carry on with the next one.
    Skip,
    /// Treat the frame as a transport failure and close.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub role: Role,
    pub malformed_frames: MalformedFramePolicy,
}

impl ConnectionOptions {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            malformed_frames: MalformedFramePolicy::Skip,
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            malformed_frames: MalformedFramePolicy::Skip,
        }
    }
}

/// Receives every message decoded by a connection's inbound worker.
///
/// Calls for one connection never overlap: the next frame is not dispatched
/// until `on_message` returns.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, connection: &Connection, message: Message);

    /// Runs once, after the connection has closed for any reason.
    async fn on_disconnected(&self, _connection: &Connection) {}
}

/// Handler that ignores every message.
pub struct NullHandler;

#[async_trait]
impl MessageHandler for NullHandler {
    async fn on_message(&self, connection: &Connection, message: Message) {
        debug!("connection {} ignoring {}", connection.id(), message.kind());
    }
}

enum Outbound {
    Message(Message),
    /// Closes the connection once everything queued before it is written.
    Close,
}

struct Inner {
    id: Uuid,
    options: ConnectionOptions,
    status: Mutex<Status>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
    callbacks: CallbackRegistry,
    sequence: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Handle to one live (or closed) connection.  Cloning is cheap and every
/// clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Starts both workers over `stream` and returns the connection in the
    /// `Connected` state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S>(stream: S, options: ConnectionOptions, handler: Arc<dyn MessageHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let connection = Connection {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                options,
                status: Mutex::new(Status::Connected),
                outbound,
                shutdown,
                callbacks: CallbackRegistry::new(),
                sequence: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
            }),
        };

        debug!("connection {} ({}) opened", connection.id(), options.role);
        tokio::spawn(run_outbound(connection.clone(), writer, queue));
        tokio::spawn(run_inbound(connection.clone(), reader, handler));
        connection
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.options.role
    }

    pub fn status(&self) -> Status {
        *self.lock_status()
    }

    /// Moves the connection to `next`.  Moving to `Disconnected` closes it.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError`] for transitions outside the state machine; the
    /// status is left unchanged.
    pub fn set_status(&self, next: Status) -> Result<(), StatusError> {
        if next == Status::Disconnected {
            self.close();
            return Ok(());
        }
        let mut status = self.lock_status();
        *status = status.transition(next)?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Disconnected
    }

    /// Queues `message` for the outbound worker.  Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] once the connection is closed.
    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.id()));
        }
        self.inner
            .outbound
            .send(Outbound::Message(message))
            .map_err(|_| ConnectionError::Closed(self.id()))
    }

    /// Closes the connection once every message queued so far has been
    /// written.
    pub fn close_after_flush(&self) {
        if self.inner.outbound.send(Outbound::Close).is_err() {
            self.close();
        }
    }

    /// Stops both workers and drops every pending continuation.  Calling it
    /// again has no effect.
    pub fn close(&self) {
        {
            let mut status = self.lock_status();
            if *status == Status::Disconnected {
                return;
            }
            *status = Status::Disconnected;
        }
        self.inner.shutdown.send_replace(true);
        self.inner.callbacks.clear();
        info!("connection {} ({}) closed", self.id(), self.role());
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.inner.callbacks
    }

    /// Total bytes read from the stream so far.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Total bytes written to the stream so far.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("status", &self.status())
            .finish()
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

async fn run_outbound<W>(
    connection: Connection,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = connection.inner.shutdown.subscribe();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => break,
            next = queue.recv() => next,
        };

        match next {
            Some(Outbound::Message(message)) => {
                if connection.is_closed() {
                    break;
                }
                let sequence = connection.inner.sequence.fetch_add(1, Ordering::Relaxed);
                let frame = match encode_message_now(&message, sequence) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(
                            "connection {}: dropping unencodable {}: {e}",
                            connection.id(),
                            message.kind()
                        );
                        continue;
                    }
                };

                let written = tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    written = writer.write_all(&frame) => written,
                };
                match written {
                    Ok(()) => {
                        connection
                            .inner
                            .bytes_sent
                            .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("connection {}: write failed: {e}", connection.id());
                        connection.close();
                        break;
                    }
                }
            }
            Some(Outbound::Close) => {
                let _ = writer.flush().await;
                connection.close();
                break;
            }
            None => break,
        }
    }

    let _ = writer.shutdown().await;
    debug!("connection {}: outbound worker stopped", connection.id());
}

async fn run_inbound<R>(connection: Connection, mut reader: R, handler: Arc<dyn MessageHandler>)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = connection.inner.shutdown.subscribe();
    let mut recv_buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    'read: loop {
        // Dispatch every complete frame already buffered.
        loop {
            let header = match peek_frame_header(&recv_buf) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    warn!("connection {}: corrupt frame header: {e}", connection.id());
                    break 'read;
                }
            };
            let frame_len = header.frame_len();
            if recv_buf.len() < frame_len {
                break;
            }

            let decoded = decode_message(&recv_buf[..frame_len]);
            recv_buf.drain(..frame_len);

            match decoded {
                Ok((message, _)) => {
                    debug!(
                        "connection {}: received {} (seq {})",
                        connection.id(),
                        message.kind(),
                        header.sequence_number
                    );
                    handler.on_message(&connection, message).await;
                }
                Err(e) => match connection.inner.options.malformed_frames {
                    MalformedFramePolicy::Skip => {
                        warn!(
                            "connection {}: dropping undecodable frame (seq {}): {e}",
                            connection.id(),
                            header.sequence_number
                        );
                    }
                    MalformedFramePolicy::Disconnect => {
                        warn!("connection {}: undecodable frame, closing: {e}", connection.id());
                        break 'read;
                    }
                },
            }

            if connection.is_closed() {
                break 'read;
            }
        }

        let read = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => break,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                debug!("connection {}: peer closed the stream", connection.id());
                break;
            }
            Ok(n) => {
                connection
                    .inner
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                recv_buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => {
                warn!("connection {}: read failed: {e}", connection.id());
                break;
            }
        }
    }

    connection.close();
    debug!("connection {}: inbound worker stopped", connection.id());
    handler.on_disconnected(&connection).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
