//! Events surfaced to the client's owner, and the handles that answer them.
//!
//! Requests that need a decision (a session invitation, an upload offer, a
//! generic call) carry a handle.  Consuming the handle sends the answer with
//! the request's correlation id.  Dropping it unanswered leaves the remote
//! side waiting.

use relay_core::protocol::messages::{GenericResponse, Message, SessionResponse};
use relay_core::{Connection, EnvelopePayload, GenericEnvelope, Status};
use tracing::info;
use uuid::Uuid;

use crate::application::client::ClientError;
use crate::application::transfer::{UploadInvitation, UploadProgress};

/// Everything the connection reports that is not the answer to one of our own
/// requests.
#[derive(Debug)]
pub enum ClientEvent {
    /// A logged-in endpoint asks to start a session with us.
    SessionRequested(SessionInvitation),
    /// The peer ended the session, or the server withdrew a session we had
    /// just confirmed.
    SessionEndedByPeer,
    /// The peer went away; we are back to `Validated`.
    PeerDisconnected,
    TextMessage(String),
    UploadRequested(UploadInvitation),
    /// Receiving side of an accepted upload.
    UploadProgress(UploadProgress),
    GenericRequest(GenericCall),
    /// Our own connection closed.
    Disconnected,
}

/// Pending session request from `requester`.
#[derive(Debug)]
pub struct SessionInvitation {
    connection: Connection,
    correlation_id: Uuid,
    requester: String,
}

impl SessionInvitation {
    pub(crate) fn new(connection: Connection, correlation_id: Uuid, requester: String) -> Self {
        Self {
            connection,
            correlation_id,
            requester,
        }
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    /// Accepts the session.  This side moves to `InSession` right away; the
    /// server sends an `EndSessionRequest` if the requester is gone by the
    /// time the confirmation arrives.
    ///
    /// # Errors
    ///
    /// [`ClientError::Status`] if this side is not `Validated`,
    /// [`ClientError::Connection`] if the connection is closed.
    pub fn confirm(self) -> Result<(), ClientError> {
        if self.connection.status() != Status::Validated {
            return Err(relay_core::StatusError {
                from: self.connection.status(),
                to: Status::InSession,
            }
            .into());
        }
        // Before sending, so a withdrawal from the server finds us InSession.
        self.connection.set_status(Status::InSession)?;
        let confirmation = Message::with_correlation(
            self.correlation_id,
            SessionResponse::new(true, self.requester.clone()),
        );
        if let Err(e) = self.connection.send(confirmation) {
            let _ = self.connection.set_status(Status::Validated);
            return Err(e.into());
        }
        info!("confirmed session with {}", self.requester);
        Ok(())
    }

    pub fn refuse(self) -> Result<(), ClientError> {
        info!("refused session with {}", self.requester);
        self.connection.send(Message::with_correlation(
            self.correlation_id,
            SessionResponse::new(false, self.requester),
        ))?;
        Ok(())
    }
}

/// Incoming application-defined request.
#[derive(Debug)]
pub struct GenericCall {
    connection: Connection,
    correlation_id: Uuid,
    envelope: GenericEnvelope,
}

impl GenericCall {
    pub(crate) fn new(connection: Connection, correlation_id: Uuid, envelope: GenericEnvelope) -> Self {
        Self {
            connection,
            correlation_id,
            envelope,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn type_name(&self) -> &str {
        &self.envelope.type_name
    }

    pub fn holds<T: EnvelopePayload>(&self) -> bool {
        self.envelope.holds::<T>()
    }

    /// Decodes the request payload.
    pub fn open<T: EnvelopePayload>(&self) -> Result<T, ClientError> {
        Ok(self.envelope.open::<T>()?)
    }

    /// Answers with `value`.
    pub fn respond<T: EnvelopePayload>(self, value: &T) -> Result<(), ClientError> {
        let envelope = GenericEnvelope::wrap(value)?;
        self.connection.send(Message::with_correlation(
            self.correlation_id,
            GenericResponse::new(envelope),
        ))?;
        Ok(())
    }

    /// Answers with an error and an empty payload.
    pub fn fail(self, error: impl Into<String>) -> Result<(), ClientError> {
        let empty = GenericEnvelope {
            type_name: self.envelope.type_name,
            payload: Vec::new(),
        };
        self.connection.send(
            Message::with_correlation(self.correlation_id, GenericResponse::new(empty))
                .with_error(error),
        )?;
        Ok(())
    }
}
