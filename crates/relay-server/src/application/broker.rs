//! Session broker: the server's registry of endpoints.
//!
//! Every accepted connection becomes an endpoint.  The broker runs the login
//! gate, pairs two logged-in endpoints into an exclusive session, relays every
//! other message between session peers, and tears sessions down when either
//! side ends them or goes away.
//!
//! Forwarded session requests are remembered by correlation id until the
//! endpoint they were forwarded to answers or disconnects.  A session response
//! that matches no such request, or comes from anyone else, is ignored.
//!
//! All registry state lives behind a single async mutex.  Each multi-step
//! operation (check-then-validate, pair-then-notify, unpair-then-notify,
//! remove) runs entirely under it, so concurrent endpoints never observe or
//! create a half-built session.  The mutex is not held while the login policy
//! decides.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::protocol::messages::{
    DisconnectRequest, EndSessionRequest, EndSessionResponse, Message, MessageBody,
    SessionRequest, SessionResponse, ValidationResponse,
};
use relay_core::{Connection, ConnectionOptions, MessageHandler, Status};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::login_policy::{LoginDecision, LoginPolicy};

/// Server-assigned endpoint identifier (the id of its connection).
pub type EndpointId = Uuid;

/// Error text returned when a session is requested by an endpoint that is not
/// logged in or already in a session.
pub const REQUESTER_UNAVAILABLE: &str =
    "Could not request a new session. The current client is already in session, or is not logged in.";

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    EndpointConnected {
        id: EndpointId,
        address: Option<SocketAddr>,
    },
    EndpointValidated {
        id: EndpointId,
        email: String,
    },
    LoginRefused {
        id: EndpointId,
        email: String,
        reason: String,
    },
    SessionStarted {
        requester: String,
        responder: String,
    },
    SessionEnded {
        first: String,
        second: String,
    },
    EndpointDisconnected {
        id: EndpointId,
        email: Option<String>,
    },
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub email: Option<String>,
    pub status: Status,
    /// Email of the session peer, if paired.
    pub paired_with: Option<String>,
    /// Bytes received from this endpoint so far.
    pub total_bytes_usage: u64,
    pub address: Option<SocketAddr>,
}

struct Endpoint {
    connection: Connection,
    address: Option<SocketAddr>,
    email: Option<String>,
    paired_with: Option<EndpointId>,
}

/// A session request forwarded to `target` and not yet answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSession {
    requester: EndpointId,
    target: EndpointId,
}

#[derive(Default)]
struct Registry {
    endpoints: HashMap<EndpointId, Endpoint>,
    /// Forwarded session requests by correlation id.
    pending: HashMap<Uuid, PendingSession>,
}

impl Registry {
    fn email_of(&self, id: EndpointId) -> Option<String> {
        self.endpoints.get(&id).and_then(|e| e.email.clone())
    }

    /// Endpoint other than `except` logged in under `email`, whatever its state.
    fn find_by_email(&self, email: &str, except: EndpointId) -> Option<EndpointId> {
        self.endpoints.iter().find_map(|(id, endpoint)| {
            let matches = endpoint
                .email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(email));
            (*id != except && matches && endpoint.connection.status().is_validated()).then_some(*id)
        })
    }

    /// Endpoint other than `except` logged in under `email` and free to pair.
    fn find_available(&self, email: &str, except: EndpointId) -> Option<EndpointId> {
        self.find_by_email(email, except).filter(|id| {
            self.endpoints
                .get(id)
                .is_some_and(|e| e.connection.status() == Status::Validated)
        })
    }

    /// Why `connection` may not log in as `email`, if anything.
    fn login_obstacle(&self, connection: &Connection, email: &str) -> Option<String> {
        if connection.status() != Status::Connected {
            return Some("already logged in".to_string());
        }
        if email.is_empty() {
            return Some("email must not be empty".to_string());
        }
        if self.find_by_email(email, connection.id()).is_some() {
            return Some("email is already in use".to_string());
        }
        None
    }

    /// Links `a` and `b` and moves both to `InSession`.
    fn pair(&mut self, a: EndpointId, b: EndpointId) -> bool {
        let (Some(first), Some(second)) = (self.endpoints.get(&a), self.endpoints.get(&b)) else {
            return false;
        };
        if first.connection.set_status(Status::InSession).is_err() {
            return false;
        }
        if second.connection.set_status(Status::InSession).is_err() {
            let _ = first.connection.set_status(Status::Validated);
            return false;
        }
        if let Some(e) = self.endpoints.get_mut(&a) {
            e.paired_with = Some(b);
        }
        if let Some(e) = self.endpoints.get_mut(&b) {
            e.paired_with = Some(a);
        }
        true
    }

    /// Breaks the session of `id`, demoting both sides to `Validated`.
    /// Returns the former peer.
    fn unpair(&mut self, id: EndpointId) -> Option<EndpointId> {
        let peer = self.endpoints.get_mut(&id)?.paired_with.take()?;
        for endpoint_id in [id, peer] {
            if let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) {
                if endpoint.paired_with == Some(id) {
                    endpoint.paired_with = None;
                }
                if endpoint.connection.status() == Status::InSession {
                    if let Err(e) = endpoint.connection.set_status(Status::Validated) {
                        debug!("endpoint {endpoint_id}: {e}");
                    }
                }
            }
        }
        Some(peer)
    }

    /// Consumes the forwarded request `correlation_id` if `responder` is the
    /// endpoint it was forwarded to.
    fn take_pending(&mut self, correlation_id: Uuid, responder: EndpointId) -> Option<PendingSession> {
        let pending = *self.pending.get(&correlation_id)?;
        if pending.target != responder {
            return None;
        }
        self.pending.remove(&correlation_id)
    }

    /// Removes every request still waiting on `target`.  Requests `target`
    /// itself made stay until their own target answers, so a late confirm can
    /// still be withdrawn.
    fn drain_pending_for(&mut self, target: EndpointId) -> Vec<(Uuid, PendingSession)> {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target == target)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    fn send_to(&self, id: EndpointId, message: Message) {
        if let Some(endpoint) = self.endpoints.get(&id) {
            if let Err(e) = endpoint.connection.send(message) {
                debug!("endpoint {id}: {e}");
            }
        }
    }
}

/// The server-side session broker.
pub struct SessionBroker {
    registry: Mutex<Registry>,
    policy: Arc<dyn LoginPolicy>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl SessionBroker {
    /// Creates a broker and the receiver for its [`BrokerEvent`]s.
    pub fn new(policy: Arc<dyn LoginPolicy>) -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            policy,
            events,
        });
        (broker, rx)
    }

    /// Registers a freshly accepted stream as a new endpoint and starts its
    /// connection.  The endpoint is in the registry before its first message
    /// is dispatched.
    pub async fn attach<S>(self: &Arc<Self>, stream: S, address: Option<SocketAddr>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut registry = self.registry.lock().await;
        let handler: Arc<dyn MessageHandler> = self.clone();
        let connection = Connection::open(stream, ConnectionOptions::server(), handler);
        registry.endpoints.insert(
            connection.id(),
            Endpoint {
                connection: connection.clone(),
                address,
                email: None,
                paired_with: None,
            },
        );
        drop(registry);

        info!("endpoint {} connected from {address:?}", connection.id());
        self.emit(BrokerEvent::EndpointConnected {
            id: connection.id(),
            address,
        });
        connection
    }

    /// Snapshot of every registered endpoint.
    pub async fn endpoints(&self) -> Vec<EndpointInfo> {
        let registry = self.registry.lock().await;
        registry
            .endpoints
            .iter()
            .map(|(id, endpoint)| EndpointInfo {
                id: *id,
                email: endpoint.email.clone(),
                status: endpoint.connection.status(),
                paired_with: endpoint.paired_with.and_then(|p| registry.email_of(p)),
                total_bytes_usage: endpoint.connection.bytes_received(),
                address: endpoint.address,
            })
            .collect()
    }

    /// Looks up a logged-in endpoint by email.
    pub async fn endpoint_by_email(&self, email: &str) -> Option<EndpointInfo> {
        self.endpoints()
            .await
            .into_iter()
            .find(|e| e.email.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(email)))
    }

    /// Closes every connection.  Each endpoint is removed as its connection
    /// reports the disconnect.
    pub async fn shutdown(&self) {
        let registry = self.registry.lock().await;
        for endpoint in registry.endpoints.values() {
            endpoint.connection.close();
        }
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    async fn handle_validation(&self, connection: &Connection, request: &Message, email: String) {
        let email = email.trim().to_string();

        let obstacle = self.registry.lock().await.login_obstacle(connection, &email);
        if let Some(reason) = obstacle {
            self.refuse_login(connection, request, email, reason);
            return;
        }

        if let LoginDecision::Refuse { reason } = self.policy.decide(&email).await {
            self.refuse_login(connection, request, email, reason);
            return;
        }

        let mut registry = self.registry.lock().await;
        // The registry may have changed while the policy was deciding.
        if let Some(reason) = registry.login_obstacle(connection, &email) {
            drop(registry);
            self.refuse_login(connection, request, email, reason);
            return;
        }
        let Some(endpoint) = registry.endpoints.get_mut(&connection.id()) else {
            return;
        };
        if let Err(e) = connection.set_status(Status::Validated) {
            drop(registry);
            self.refuse_login(connection, request, email, e.to_string());
            return;
        }
        endpoint.email = Some(email.clone());
        let _ = connection.send(Message::reply_to(request, ValidationResponse::new(true)));
        drop(registry);

        info!("endpoint {} logged in as {email}", connection.id());
        self.emit(BrokerEvent::EndpointValidated {
            id: connection.id(),
            email,
        });
    }

    fn refuse_login(&self, connection: &Connection, request: &Message, email: String, reason: String) {
        info!("endpoint {}: login for {email} refused: {reason}", connection.id());
        let reply = Message::reply_to(request, ValidationResponse::new(false))
            .with_error(format!("Login failed for user {email}: {reason}"));
        let _ = connection.send(reply);
        self.emit(BrokerEvent::LoginRefused {
            id: connection.id(),
            email,
            reason,
        });
    }

    async fn handle_session_request(&self, connection: &Connection, request: Message, target: String) {
        let mut registry = self.registry.lock().await;
        let id = connection.id();

        if !request.is_correlated() {
            warn!("endpoint {id}: uncorrelated session request, ignoring");
            return;
        }

        let requester_email = match registry.email_of(id) {
            Some(email) if connection.status() == Status::Validated => email,
            _ => {
                let reply = Message::reply_to(&request, SessionResponse::new(false, target))
                    .with_error(REQUESTER_UNAVAILABLE);
                let _ = connection.send(reply);
                return;
            }
        };

        let Some(target_id) = registry.find_available(&target, id) else {
            debug!("endpoint {id}: session target {target} unavailable");
            let reply = Message::reply_to(&request, SessionResponse::new(false, target.clone()))
                .with_error(format!(
                    "{target} does not exist, is not logged in, or is in session with another user."
                ));
            let _ = connection.send(reply);
            return;
        };

        // Forward the original request, correlation id included, naming the
        // requester instead of the target.
        let mut forwarded = request;
        forwarded.body = MessageBody::SessionRequest(SessionRequest {
            email: requester_email.clone(),
        });
        info!("{requester_email} requests a session with {target}");
        registry.pending.insert(
            forwarded.correlation_id,
            PendingSession {
                requester: id,
                target: target_id,
            },
        );
        registry.send_to(target_id, forwarded);
    }

    async fn handle_session_response(&self, connection: &Connection, response: Message, is_confirmed: bool) {
        let mut registry = self.registry.lock().await;
        let id = connection.id();

        let Some(responder_email) = registry.email_of(id) else {
            warn!("endpoint {id}: session response before login, ignoring");
            return;
        };
        let Some(pending) = registry.take_pending(response.correlation_id, id) else {
            warn!(
                "endpoint {id}: {responder_email} answered session request {} it was never sent, ignoring",
                response.correlation_id
            );
            return;
        };
        let requester_id = pending.requester;
        let Some(requester) = registry.email_of(requester_id) else {
            debug!("{responder_email} answered a requester who is gone");
            if is_confirmed && connection.status() == Status::Validated {
                let _ = connection.send(Message::new(EndSessionRequest));
            }
            return;
        };

        let accepted = is_confirmed && !response.has_error;
        let mut forwarded = response;
        forwarded.body =
            MessageBody::SessionResponse(SessionResponse::new(false, responder_email.clone()));

        if !accepted {
            info!("{responder_email} refused the session with {requester}");
            forwarded = forwarded.with_error(format!(
                "The session request was refused by {responder_email}"
            ));
            registry.send_to(requester_id, forwarded);
            return;
        }

        let requester_free = registry
            .endpoints
            .get(&requester_id)
            .is_some_and(|e| e.connection.status() == Status::Validated);
        let responder_free = connection.status() == Status::Validated;

        if !responder_free {
            forwarded = forwarded.with_error(format!(
                "{responder_email} is already in session with another user."
            ));
            registry.send_to(requester_id, forwarded);
            return;
        }
        if !requester_free || !registry.pair(requester_id, id) {
            // Both sides hear about it: the requester's request fails and the
            // responder leaves the session it entered when confirming.
            info!("{requester} is no longer available for {responder_email}");
            registry.send_to(requester_id, forwarded.with_error(REQUESTER_UNAVAILABLE));
            let _ = connection.send(Message::new(EndSessionRequest));
            return;
        }

        forwarded.body =
            MessageBody::SessionResponse(SessionResponse::new(true, responder_email.clone()));
        registry.send_to(requester_id, forwarded);
        drop(registry);

        info!("session started between {requester} and {responder_email}");
        self.emit(BrokerEvent::SessionStarted {
            requester,
            responder: responder_email,
        });
    }

    async fn handle_end_session(&self, connection: &Connection, request: Message) {
        let mut registry = self.registry.lock().await;
        let id = connection.id();

        let Some(peer) = registry.unpair(id) else {
            let reply = Message::reply_to(&request, EndSessionResponse::default())
                .with_error("not in a session");
            let _ = connection.send(reply);
            return;
        };

        registry.send_to(peer, Message::new(EndSessionRequest));
        let _ = connection.send(Message::reply_to(&request, EndSessionResponse::default()));
        let ended = (registry.email_of(id), registry.email_of(peer));
        drop(registry);

        self.emit_session_ended(ended);
    }

    async fn handle_disconnect_request(&self, connection: &Connection) {
        let mut registry = self.registry.lock().await;
        let id = connection.id();

        if let Some(peer) = registry.unpair(id) {
            registry.send_to(peer, Message::new(DisconnectRequest));
            let ended = (registry.email_of(id), registry.email_of(peer));
            drop(registry);
            self.emit_session_ended(ended);
        } else {
            drop(registry);
        }

        debug!("endpoint {id} asked to disconnect");
        connection.close();
    }

    async fn relay(&self, connection: &Connection, message: Message) {
        let registry = self.registry.lock().await;
        let id = connection.id();

        let peer = registry
            .endpoints
            .get(&id)
            .and_then(|e| e.paired_with)
            .filter(|_| connection.status() == Status::InSession);

        match peer {
            Some(peer) => registry.send_to(peer, message),
            None => debug!("endpoint {id}: dropping {} outside a session", message.kind()),
        }
    }

    fn emit_session_ended(&self, (first, second): (Option<String>, Option<String>)) {
        let first = first.unwrap_or_default();
        let second = second.unwrap_or_default();
        info!("session between {first} and {second} ended");
        self.emit(BrokerEvent::SessionEnded { first, second });
    }
}

#[async_trait]
impl MessageHandler for SessionBroker {
    async fn on_message(&self, connection: &Connection, message: Message) {
        match &message.body {
            MessageBody::ValidationRequest(request) => {
                let email = request.email.clone();
                self.handle_validation(connection, &message, email).await;
            }
            MessageBody::SessionRequest(request) => {
                let target = request.email.clone();
                self.handle_session_request(connection, message, target).await;
            }
            MessageBody::SessionResponse(response) => {
                let confirmed = response.is_confirmed;
                self.handle_session_response(connection, message, confirmed).await;
            }
            MessageBody::EndSessionRequest(_) => self.handle_end_session(connection, message).await,
            MessageBody::DisconnectRequest(_) => self.handle_disconnect_request(connection).await,
            MessageBody::ValidationResponse(_)
            | MessageBody::EndSessionResponse(_)
            | MessageBody::TextMessageRequest(_)
            | MessageBody::FileUploadRequest(_)
            | MessageBody::FileUploadResponse(_)
            | MessageBody::RemoteFrameRequest(_)
            | MessageBody::RemoteFrameResponse(_)
            | MessageBody::GenericRequest(_)
            | MessageBody::GenericResponse(_) => self.relay(connection, message).await,
        }
    }

    async fn on_disconnected(&self, connection: &Connection) {
        let mut registry = self.registry.lock().await;
        let id = connection.id();

        let ended = registry.unpair(id).map(|peer| {
            registry.send_to(peer, Message::new(DisconnectRequest));
            (registry.email_of(id), registry.email_of(peer))
        });

        // Requests this endpoint never answered fail on the requester's side.
        let gone = registry.email_of(id).unwrap_or_default();
        for (correlation_id, pending) in registry.drain_pending_for(id) {
            let reply = Message::with_correlation(
                correlation_id,
                SessionResponse::new(false, gone.clone()),
            )
            .with_error(format!("{gone} disconnected before answering the session request"));
            registry.send_to(pending.requester, reply);
        }

        let email = registry.endpoints.remove(&id).and_then(|e| e.email);
        drop(registry);

        if let Some(ended) = ended {
            self.emit_session_ended(ended);
        }
        info!("endpoint {id} ({}) disconnected", email.as_deref().unwrap_or("not logged in"));
        self.emit(BrokerEvent::EndpointDisconnected { id, email });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
