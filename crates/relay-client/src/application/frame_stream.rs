//! Pull-based screen-frame streaming.
//!
//! The requester sends a [`RemoteFrameRequest`] and keeps one continuation
//! registered for the whole stream.  Each [`RemoteFrameResponse`] is handed to
//! the caller, who decides whether to pull the next frame (same correlation
//! id) or stop.  Stopping, from inside the callback or through
//! [`FrameStream::cancel`], removes the continuation and sends a terminal
//! response with `cancel = true`; anything arriving afterwards is dropped.

use std::sync::Arc;

use relay_core::protocol::messages::{Message, RemoteFrameRequest, RemoteFrameResponse};
use relay_core::Connection;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::client::ClientError;

/// Errors raised by a [`FrameProvider`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("screen capture is not available on this endpoint")]
    Unavailable,
    #[error("screen capture failed: {0}")]
    Capture(String),
}

/// Source of encoded screen frames on the responding side.
///
/// Called on the blocking thread pool.
#[cfg_attr(test, mockall::automock)]
pub trait FrameProvider: Send + Sync {
    fn capture(&self, quality: u8) -> Result<Vec<u8>, FrameError>;
}

/// What the frame callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameControl {
    Continue,
    Stop,
}

/// Handle to a running frame stream.
#[derive(Debug, Clone)]
pub struct FrameStream {
    connection: Connection,
    id: Uuid,
}

impl FrameStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `false` once the stream has been stopped or cancelled, or the
    /// connection has closed.
    pub fn is_active(&self) -> bool {
        self.connection.callbacks().contains(&self.id)
    }

    /// Ends the stream.  Calling it again has no effect.
    pub fn cancel(&self) {
        end_stream(&self.connection, self.id);
    }
}

pub(crate) fn start_frames<F>(
    connection: &Connection,
    quality: u8,
    mut on_frame: F,
) -> Result<FrameStream, ClientError>
where
    F: FnMut(Result<Vec<u8>, String>) -> FrameControl + Send + 'static,
{
    let quality = quality.min(100);
    let id = Uuid::new_v4();

    connection
        .callbacks()
        .register::<RemoteFrameResponse, _>(id, move |connection, reply| {
            if reply.body.cancel {
                connection.callbacks().remove(&reply.correlation_id);
                return;
            }
            let frame = if reply.has_error {
                Err(reply.error_text().to_string())
            } else {
                Ok(reply.body.frame)
            };
            match on_frame(frame) {
                FrameControl::Continue => {
                    let next = Message::with_correlation(id, RemoteFrameRequest { quality });
                    if let Err(e) = connection.send(next) {
                        debug!("frame stream {id}: {e}");
                        connection.callbacks().remove(&id);
                    }
                }
                FrameControl::Stop => end_stream(connection, id),
            }
        })?;

    if let Err(e) = connection.send(Message::with_correlation(id, RemoteFrameRequest { quality })) {
        connection.callbacks().remove(&id);
        return Err(e.into());
    }
    debug!("frame stream {id} started at quality {quality}");
    Ok(FrameStream {
        connection: connection.clone(),
        id,
    })
}

fn end_stream(connection: &Connection, id: Uuid) {
    if connection.callbacks().remove(&id) {
        debug!("frame stream {id} stopped");
        let _ = connection.send(Message::with_correlation(id, RemoteFrameResponse::cancelled()));
    }
}

/// Answers one [`RemoteFrameRequest`] from the session peer.  Capture runs on
/// the blocking pool so the inbound worker keeps reading.
pub(crate) fn respond(connection: &Connection, frames: &Arc<dyn FrameProvider>, request: &Message, quality: u8) {
    let connection = connection.clone();
    let frames = Arc::clone(frames);
    let correlation_id = request.correlation_id;

    tokio::spawn(async move {
        let captured = tokio::task::spawn_blocking(move || frames.capture(quality)).await;
        let reply = match captured {
            Ok(Ok(frame)) => Message::with_correlation(correlation_id, RemoteFrameResponse::frame(frame)),
            Ok(Err(e)) => {
                warn!("frame request {correlation_id}: {e}");
                Message::with_correlation(correlation_id, RemoteFrameResponse::frame(Vec::new()))
                    .with_error(e.to_string())
            }
            Err(e) => {
                warn!("frame request {correlation_id}: capture task failed: {e}");
                Message::with_correlation(correlation_id, RemoteFrameResponse::frame(Vec::new()))
                    .with_error("screen capture failed")
            }
        };
        if let Err(e) = connection.send(reply) {
            debug!("frame request {correlation_id}: {e}");
        }
    });
}
