//! End-to-end tests: real TCP, a running [`RelayListener`] and
//! [`SessionBroker`], and `relay-client` endpoints talking through them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_client::infrastructure::file_store::MemoryFileStore;
use relay_client::infrastructure::frame_provider::{StaticFrameProvider, UnavailableFrameProvider};
use relay_client::{
    connect, ClientError, ClientEvent, ClientOptions, ClientServices, FrameControl, FrameProvider,
    RelayClient,
};
use relay_core::{EnvelopePayload, Status};
use relay_server::application::broker::REQUESTER_UNAVAILABLE;
use relay_server::{AllowAll, AllowList, BrokerEvent, LoginPolicy, RelayListener, SessionBroker};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    broker: Arc<SessionBroker>,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    running: Arc<AtomicBool>,
}

impl TestServer {
    async fn start(policy: Arc<dyn LoginPolicy>) -> Self {
        let listener = RelayListener::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let addr = listener.local_addr();
        let (broker, events) = SessionBroker::new(policy);
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(listener.serve(Arc::clone(&broker), Arc::clone(&running)));
        Self {
            addr,
            broker,
            events,
            running,
        }
    }

    /// Waits for the first broker event matching `wanted`, skipping others.
    async fn expect_event(&mut self, wanted: impl Fn(&BrokerEvent) -> bool) -> BrokerEvent {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a broker event")
                .expect("broker event channel closed");
            if wanted(&event) {
                return event;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

struct Endpoint {
    client: RelayClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    files: Arc<MemoryFileStore>,
}

impl Endpoint {
    async fn connect_with(server: &TestServer, frames: Arc<dyn FrameProvider>) -> Self {
        let files = Arc::new(MemoryFileStore::new());
        let services = ClientServices::new(files.clone(), frames);
        let (client, events) = connect(server.addr, services, ClientOptions::default())
            .await
            .expect("connect");
        Self {
            client,
            events,
            files,
        }
    }

    async fn connect(server: &TestServer) -> Self {
        Self::connect_with(server, Arc::new(UnavailableFrameProvider)).await
    }

    async fn logged_in(server: &TestServer, email: &str) -> Self {
        let endpoint = Self::connect(server).await;
        endpoint.client.login(email).await.expect("login");
        endpoint
    }

    async fn next_event(&mut self) -> ClientEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a client event")
            .expect("client event channel closed")
    }
}

/// `requester` asks for `responder`, who confirms.
async fn open_session(requester: &Endpoint, responder: &mut Endpoint, responder_email: &str) {
    let request = tokio::spawn({
        let client = requester.client.clone();
        let peer = responder_email.to_string();
        async move { client.request_session(peer).await }
    });
    match responder.next_event().await {
        ClientEvent::SessionRequested(invitation) => invitation.confirm().expect("confirm"),
        other => panic!("expected a session invitation, got {other:?}"),
    }
    let peer = timeout(WAIT, request)
        .await
        .expect("timed out")
        .expect("join")
        .expect("session");
    assert_eq!(peer, responder_email);
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl EnvelopePayload for Echo {
    const TYPE_NAME: &'static str = "test.Echo";
}

#[tokio::test]
async fn test_login_registers_endpoint_with_broker() {
    let mut server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice@example.com").await;

    assert_eq!(alice.client.status(), Status::Validated);
    let event = server
        .expect_event(|e| matches!(e, BrokerEvent::EndpointValidated { .. }))
        .await;
    assert!(
        matches!(event, BrokerEvent::EndpointValidated { ref email, .. } if email == "alice@example.com")
    );

    let info = server
        .broker
        .endpoint_by_email("alice@example.com")
        .await
        .expect("registered");
    assert_eq!(info.status, Status::Validated);
    assert!(info.paired_with.is_none());
    assert!(info.total_bytes_usage > 0);
}

#[tokio::test]
async fn test_session_with_unknown_peer_fails() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;

    let result = alice.client.request_session("bob").await;
    assert!(matches!(result, Err(ClientError::Remote(ref e)) if e.contains("does not exist")));
    assert_eq!(alice.client.status(), Status::Validated);
}

#[tokio::test]
async fn test_session_request_before_login_is_rejected() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let _bob = Endpoint::logged_in(&server, "bob").await;
    let anonymous = Endpoint::connect(&server).await;

    let result = anonymous.client.request_session("bob").await;
    assert!(matches!(result, Err(ClientError::Remote(ref e)) if e == REQUESTER_UNAVAILABLE));
    assert_eq!(anonymous.client.status(), Status::Connected);
}

#[tokio::test]
async fn test_duplicate_email_is_refused() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let _first = Endpoint::logged_in(&server, "alice").await;
    let second = Endpoint::connect(&server).await;

    let result = second.client.login("ALICE").await;
    assert!(matches!(result, Err(ClientError::Remote(ref e)) if e.contains("Login failed for user ALICE")));
    assert_eq!(second.client.status(), Status::Connected);
}

#[tokio::test]
async fn test_allow_list_refuses_unknown_email() {
    let mut server = TestServer::start(Arc::new(AllowList::new(["alice@example.com"]))).await;
    let mallory = Endpoint::connect(&server).await;

    let result = mallory.client.login("mallory@example.com").await;
    assert!(matches!(result, Err(ClientError::Remote(ref e)) if e.contains("not on the allow list")));

    let event = server
        .expect_event(|e| matches!(e, BrokerEvent::LoginRefused { .. }))
        .await;
    assert!(matches!(event, BrokerEvent::LoginRefused { ref email, .. } if email == "mallory@example.com"));

    let alice = Endpoint::connect(&server).await;
    alice.client.login("Alice@Example.com").await.expect("listed email");
}

#[tokio::test]
async fn test_confirmed_session_relays_text() {
    let mut server = TestServer::start(Arc::new(AllowAll)).await;
    let mut alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;

    open_session(&alice, &mut bob, "bob").await;
    assert_eq!(alice.client.status(), Status::InSession);
    assert_eq!(bob.client.status(), Status::InSession);
    let started = server
        .expect_event(|e| matches!(e, BrokerEvent::SessionStarted { .. }))
        .await;
    assert_eq!(
        started,
        BrokerEvent::SessionStarted {
            requester: "alice".to_string(),
            responder: "bob".to_string(),
        }
    );

    alice.client.send_text("hi bob").expect("send");
    bob.client.send_text("hi alice").expect("send");
    assert!(matches!(bob.next_event().await, ClientEvent::TextMessage(ref t) if t == "hi bob"));
    assert!(matches!(alice.next_event().await, ClientEvent::TextMessage(ref t) if t == "hi alice"));

    let info = server.broker.endpoint_by_email("alice").await.expect("alice");
    assert_eq!(info.paired_with.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_refused_session_keeps_both_validated() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;

    let request = tokio::spawn({
        let client = alice.client.clone();
        async move { client.request_session("bob").await }
    });
    match bob.next_event().await {
        ClientEvent::SessionRequested(invitation) => {
            assert_eq!(invitation.requester(), "alice");
            invitation.refuse().expect("refuse");
        }
        other => panic!("expected a session invitation, got {other:?}"),
    }

    let result = request.await.expect("join");
    assert!(
        matches!(result, Err(ClientError::Remote(ref e)) if e == "The session request was refused by bob")
    );
    assert_eq!(alice.client.status(), Status::Validated);
    assert_eq!(bob.client.status(), Status::Validated);
}

#[tokio::test]
async fn test_late_confirm_fails_requester_already_in_session() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;
    let mut carol = Endpoint::logged_in(&server, "carol").await;

    let ask = |peer: &'static str| {
        let client = alice.client.clone();
        tokio::spawn(async move { client.request_session(peer).await })
    };
    let to_bob = ask("bob");
    let to_carol = ask("carol");
    let bob_invitation = match bob.next_event().await {
        ClientEvent::SessionRequested(invitation) => invitation,
        other => panic!("expected a session invitation, got {other:?}"),
    };
    match carol.next_event().await {
        ClientEvent::SessionRequested(invitation) => invitation.confirm().expect("confirm"),
        other => panic!("expected a session invitation, got {other:?}"),
    }
    assert_eq!(to_carol.await.expect("join").expect("session"), "carol");

    bob_invitation.confirm().expect("confirm");
    let result = timeout(WAIT, to_bob).await.expect("timed out").expect("join");
    assert!(
        matches!(result, Err(ClientError::Remote(ref e)) if e == REQUESTER_UNAVAILABLE),
        "{result:?}"
    );
    assert!(matches!(bob.next_event().await, ClientEvent::SessionEndedByPeer));
    assert_eq!(bob.client.status(), Status::Validated);
    assert_eq!(alice.client.status(), Status::InSession);
    let info = server.broker.endpoint_by_email("alice").await.expect("alice");
    assert_eq!(info.paired_with.as_deref(), Some("carol"));
}

#[tokio::test]
async fn test_upload_through_relay() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;
    open_session(&alice, &mut bob, "bob").await;

    let source: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();
    alice.files.insert("/home/alice/photo.jpg", source.clone());

    let upload = tokio::spawn({
        let client = alice.client.clone();
        async move { client.upload("/home/alice/photo.jpg").await }
    });
    match bob.next_event().await {
        ClientEvent::UploadRequested(invitation) => {
            assert_eq!(invitation.file_name(), "photo.jpg");
            assert_eq!(invitation.total_bytes(), 2500);
            invitation.accept("/downloads/photo.jpg").expect("accept");
        }
        other => panic!("expected an upload offer, got {other:?}"),
    }

    let transferred = timeout(WAIT, upload)
        .await
        .expect("timed out")
        .expect("join")
        .expect("upload");
    assert_eq!(transferred, 2500);
    assert_eq!(alice.files.read_count(), 3);
    assert_eq!(bob.files.contents("/downloads/photo.jpg"), Some(source));
}

#[tokio::test]
async fn test_frames_through_relay_until_cancel() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::connect_with(&server, Arc::new(StaticFrameProvider::new(vec![1, 2, 3, 4]))).await;
    bob.client.login("bob").await.expect("login");
    open_session(&alice, &mut bob, "bob").await;

    let (tx, mut frames) = mpsc::unbounded_channel();
    let stream = alice
        .client
        .request_frames(90, move |frame| {
            let _ = tx.send(frame);
            FrameControl::Continue
        })
        .expect("start");

    for _ in 0..2 {
        let frame = timeout(WAIT, frames.recv())
            .await
            .expect("timed out")
            .expect("frame");
        assert_eq!(frame, Ok(vec![1, 2, 3, 4]));
    }
    stream.cancel();
    assert!(!stream.is_active());
    assert!(alice.client.connection().callbacks().is_empty());
}

#[tokio::test]
async fn test_generic_call_through_relay() {
    let server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;
    open_session(&alice, &mut bob, "bob").await;

    let call = tokio::spawn({
        let client = alice.client.clone();
        async move {
            client
                .call::<Echo, Echo>(&Echo {
                    text: "ping".to_string(),
                })
                .await
        }
    });
    match bob.next_event().await {
        ClientEvent::GenericRequest(request) => {
            let Echo { text } = request.open().expect("open");
            request
                .respond(&Echo {
                    text: format!("{text}/pong"),
                })
                .expect("respond");
        }
        other => panic!("expected a generic request, got {other:?}"),
    }

    let reply = timeout(WAIT, call).await.expect("timed out").expect("join").expect("call");
    assert_eq!(reply.text, "ping/pong");
}

#[tokio::test]
async fn test_end_session_returns_both_to_validated() {
    let mut server = TestServer::start(Arc::new(AllowAll)).await;
    let alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;
    open_session(&alice, &mut bob, "bob").await;

    alice.client.end_session().await.expect("end session");
    assert_eq!(alice.client.status(), Status::Validated);
    assert!(matches!(bob.next_event().await, ClientEvent::SessionEndedByPeer));
    assert_eq!(bob.client.status(), Status::Validated);
    server
        .expect_event(|e| matches!(e, BrokerEvent::SessionEnded { .. }))
        .await;

    // Text outside a session is dropped by the server.
    alice.client.send_text("anyone?").expect("send");
    assert!(timeout(Duration::from_millis(200), bob.events.recv()).await.is_err());

    let again = alice.client.end_session().await;
    assert!(matches!(again, Err(ClientError::Remote(ref e)) if e == "not in a session"));
}

#[tokio::test]
async fn test_peer_disconnect_returns_survivor_to_validated() {
    let mut server = TestServer::start(Arc::new(AllowAll)).await;
    let mut alice = Endpoint::logged_in(&server, "alice").await;
    let mut bob = Endpoint::logged_in(&server, "bob").await;
    open_session(&alice, &mut bob, "bob").await;

    bob.client.disconnect();
    assert!(matches!(alice.next_event().await, ClientEvent::PeerDisconnected));
    assert_eq!(alice.client.status(), Status::Validated);
    assert!(matches!(bob.next_event().await, ClientEvent::Disconnected));

    server
        .expect_event(|event| {
            matches!(event, BrokerEvent::EndpointDisconnected { email: Some(email), .. } if email == "bob")
        })
        .await;
    assert!(server.broker.endpoint_by_email("bob").await.is_none());

    // The survivor can pair again.
    let mut carol = Endpoint::logged_in(&server, "carol").await;
    open_session(&alice, &mut carol, "carol").await;
    assert_eq!(alice.client.status(), Status::InSession);
}

#[tokio::test]
async fn test_shutdown_closes_endpoints() {
    let mut server = TestServer::start(Arc::new(AllowAll)).await;
    let mut alice = Endpoint::logged_in(&server, "alice").await;

    server.broker.shutdown().await;
    assert!(matches!(alice.next_event().await, ClientEvent::Disconnected));
    server
        .expect_event(|e| matches!(e, BrokerEvent::EndpointDisconnected { .. }))
        .await;
    assert!(server.broker.endpoints().await.is_empty());
}
