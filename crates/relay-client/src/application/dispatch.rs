//! Client-side [`MessageHandler`].
//!
//! Responses update the local status (login, session start, session end) and
//! are then routed to the continuation waiting on their correlation id.
//! Requests from the server or the session peer become [`ClientEvent`]s, or
//! are answered directly by the transfer and frame-stream protocols.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::protocol::messages::{Message, MessageBody};
use relay_core::{Connection, MessageHandler, Status};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::application::events::{ClientEvent, GenericCall, SessionInvitation};
use crate::application::frame_stream::{self, FrameProvider};
use crate::application::transfer::{self, AcceptedUploads, FileStore};

pub(crate) struct ClientDispatcher {
    files: Arc<dyn FileStore>,
    frames: Arc<dyn FrameProvider>,
    events: mpsc::UnboundedSender<ClientEvent>,
    /// Uploads accepted from the current session peer.
    accepted: AcceptedUploads,
}

impl ClientDispatcher {
    pub(crate) fn new(
        files: Arc<dyn FileStore>,
        frames: Arc<dyn FrameProvider>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            files,
            frames,
            events,
            accepted: AcceptedUploads::default(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn transition(connection: &Connection, next: Status) {
        if let Err(e) = connection.set_status(next) {
            debug!("connection {}: {e}", connection.id());
        }
    }

    /// Back to `Validated` if a session was active.
    fn leave_session(connection: &Connection) -> bool {
        if connection.status() == Status::InSession {
            Self::transition(connection, Status::Validated);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl MessageHandler for ClientDispatcher {
    async fn on_message(&self, connection: &Connection, message: Message) {
        match &message.body {
            // Responses: status effect first, then the waiting continuation.
            MessageBody::ValidationResponse(response) => {
                if !message.has_error && response.is_valid {
                    Self::transition(connection, Status::Validated);
                }
                connection.callbacks().resolve(connection, message);
            }
            MessageBody::SessionResponse(response) => {
                if !message.has_error && response.is_confirmed {
                    info!("session with {} started", response.email);
                    Self::transition(connection, Status::InSession);
                }
                connection.callbacks().resolve(connection, message);
            }
            MessageBody::EndSessionResponse(_) => {
                if !message.has_error {
                    Self::leave_session(connection);
                    self.accepted.clear();
                }
                connection.callbacks().resolve(connection, message);
            }
            MessageBody::FileUploadResponse(_)
            | MessageBody::RemoteFrameResponse(_)
            | MessageBody::GenericResponse(_) => {
                connection.callbacks().resolve(connection, message);
            }

            // Requests.
            MessageBody::SessionRequest(request) => {
                let requester = request.email.clone();
                info!("session requested by {requester}");
                self.emit(ClientEvent::SessionRequested(SessionInvitation::new(
                    connection.clone(),
                    message.correlation_id,
                    requester,
                )));
            }
            MessageBody::EndSessionRequest(_) => {
                self.accepted.clear();
                if Self::leave_session(connection) {
                    info!("session ended by the other side");
                    self.emit(ClientEvent::SessionEndedByPeer);
                }
            }
            MessageBody::DisconnectRequest(_) => {
                Self::leave_session(connection);
                self.accepted.clear();
                info!("session peer disconnected");
                self.emit(ClientEvent::PeerDisconnected);
            }
            MessageBody::TextMessageRequest(text) => {
                self.emit(ClientEvent::TextMessage(text.message.clone()));
            }
            MessageBody::FileUploadRequest(_) => {
                let correlation_id = message.correlation_id;
                if let MessageBody::FileUploadRequest(request) = message.body {
                    if let Some(event) =
                        transfer::receive(connection, &self.files, &self.accepted, correlation_id, request)
                    {
                        self.emit(event);
                    }
                }
            }
            MessageBody::RemoteFrameRequest(request) => {
                frame_stream::respond(connection, &self.frames, &message, request.quality);
            }
            MessageBody::GenericRequest(envelope) => {
                self.emit(ClientEvent::GenericRequest(GenericCall::new(
                    connection.clone(),
                    message.correlation_id,
                    envelope.clone(),
                )));
            }
            MessageBody::ValidationRequest(_) => {
                debug!("connection {}: ignoring {}", connection.id(), message.kind());
            }
        }
    }

    async fn on_disconnected(&self, connection: &Connection) {
        info!("connection {} to the server closed", connection.id());
        self.accepted.clear();
        self.emit(ClientEvent::Disconnected);
    }
}
