//! Peer-to-peer protocol tests.
//!
//! Two clients are joined back to back over an in-memory duplex pipe.  The
//! server relays session traffic verbatim, so this exercises the transfer,
//! frame-stream, text and generic-envelope protocols end to end without one.

use std::sync::Arc;
use std::time::Duration;

use relay_client::infrastructure::file_store::MemoryFileStore;
use relay_client::infrastructure::frame_provider::{StaticFrameProvider, UnavailableFrameProvider};
use relay_client::{
    ClientError, ClientEvent, ClientOptions, ClientServices, FrameControl, FrameProvider,
    RelayClient, UploadProgress, UploadStatus, UPLOAD_REFUSED,
};
use relay_core::protocol::messages::{FileUploadRequest, FileUploadResponse};
use relay_core::{EnvelopePayload, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

impl EnvelopePayload for AddRequest {
    const TYPE_NAME: &'static str = "calc.AddRequest";
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}

impl EnvelopePayload for AddResponse {
    const TYPE_NAME: &'static str = "calc.AddResponse";
}

struct Peer {
    client: RelayClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    files: Arc<MemoryFileStore>,
}

impl Peer {
    async fn next_event(&mut self) -> ClientEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }
}

fn peers_with(frames: Arc<dyn FrameProvider>, buffer_size: u32) -> (Peer, Peer) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let options = ClientOptions {
        upload_buffer_size: buffer_size,
        ..ClientOptions::default()
    };

    let make = |stream, frames: Arc<dyn FrameProvider>| {
        let files = Arc::new(MemoryFileStore::new());
        let (client, events) =
            RelayClient::open(stream, ClientServices::new(files.clone(), frames), options);
        Peer {
            client,
            events,
            files,
        }
    };
    (
        make(a, Arc::new(UnavailableFrameProvider)),
        make(b, frames),
    )
}

fn peers() -> (Peer, Peer) {
    peers_with(Arc::new(UnavailableFrameProvider), 1024)
}

/// Accepts the next upload offer into `destination`.
async fn accept_upload(peer: &mut Peer, destination: &str) {
    match peer.next_event().await {
        ClientEvent::UploadRequested(invitation) => invitation.accept(destination).expect("accept"),
        other => panic!("expected an upload offer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_of_2500_bytes_takes_three_chunks() {
    let (alice, mut bob) = peers();
    let source: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    alice.files.insert("/alice/report.bin", source.clone());

    let (tx, mut progress) = mpsc::unbounded_channel::<UploadProgress>();
    alice
        .client
        .upload_file("/alice/report.bin", move |p| {
            let _ = tx.send(p);
        })
        .expect("upload");

    accept_upload(&mut bob, "/bob/report.bin").await;

    let mut seen = Vec::new();
    loop {
        let p = timeout(WAIT, progress.recv())
            .await
            .expect("timed out")
            .expect("progress");
        let done = p.status != UploadStatus::InProgress;
        seen.push(p);
        if done {
            break;
        }
    }

    let last = seen.last().expect("at least one report");
    assert_eq!(last.status, UploadStatus::Completed);
    assert_eq!(last.transferred, 2500);
    assert_eq!(
        seen.iter().map(|p| p.transferred).collect::<Vec<_>>(),
        vec![0, 1024, 2048, 2500]
    );
    assert_eq!(alice.files.read_count(), 3, "one read per chunk");
    assert_eq!(bob.files.append_count(), 3, "one append per chunk");
    assert_eq!(bob.files.contents("/bob/report.bin"), Some(source));
    assert!(alice.client.connection().callbacks().is_empty());
}

#[tokio::test]
async fn test_receiver_reports_progress_until_complete() {
    let (alice, mut bob) = peers_with(Arc::new(UnavailableFrameProvider), 100);
    alice.files.insert("/a.txt", vec![b'x'; 250]);

    let upload = tokio::spawn({
        let client = alice.client.clone();
        async move { client.upload("/a.txt").await }
    });
    accept_upload(&mut bob, "/b.txt").await;

    let mut statuses = Vec::new();
    loop {
        match bob.next_event().await {
            ClientEvent::UploadProgress(p) => {
                let done = p.status == UploadStatus::Completed;
                statuses.push(p.transferred);
                if done {
                    break;
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(statuses, vec![100, 200, 250]);
    assert_eq!(upload.await.expect("join").expect("upload"), 250);
}

#[tokio::test]
async fn test_empty_file_completes_without_chunks() {
    let (alice, mut bob) = peers();
    alice.files.insert("/empty", Vec::new());

    let upload = tokio::spawn({
        let client = alice.client.clone();
        async move { client.upload("/empty").await }
    });
    accept_upload(&mut bob, "/copy").await;

    assert_eq!(upload.await.expect("join").expect("upload"), 0);
    assert_eq!(alice.files.read_count(), 0);
    assert_eq!(bob.files.contents("/copy"), Some(Vec::new()));
}

#[tokio::test]
async fn test_refused_upload_fails_with_refusal_text() {
    let (alice, mut bob) = peers();
    alice.files.insert("/secret", vec![1, 2, 3]);

    let upload = tokio::spawn({
        let client = alice.client.clone();
        async move { client.upload("/secret").await }
    });
    match bob.next_event().await {
        ClientEvent::UploadRequested(invitation) => invitation.refuse().expect("refuse"),
        other => panic!("expected an upload offer, got {other:?}"),
    }

    let result = upload.await.expect("join");
    assert!(matches!(result, Err(ClientError::Remote(ref e)) if e == UPLOAD_REFUSED));
    assert_eq!(bob.files.contents("/secret"), None);
}

#[tokio::test]
async fn test_chunk_without_accepted_offer_is_refused() {
    let (alice, bob) = peers();

    // A chunk that skips the offer and names its own destination.
    let offer = FileUploadRequest::offer("x", "/alice/x", 4, 1024);
    let mut chunk = FileUploadRequest::next_chunk(&FileUploadResponse::echo(&offer), vec![1, 2, 3, 4], 1024);
    chunk.destination_path = "/bob/.profile".to_string();

    let id = Uuid::new_v4();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    let connection = alice.client.connection();
    connection
        .callbacks()
        .register::<FileUploadResponse, _>(id, move |_, reply| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(reply);
            }
        })
        .expect("register");
    connection.send(Message::with_correlation(id, chunk)).expect("send");

    let reply = timeout(WAIT, rx).await.expect("timed out").expect("reply");
    assert!(reply.has_error);
    assert!(reply.body.delete_callback_on_receipt);
    assert_eq!(bob.files.append_count(), 0);
    assert_eq!(bob.files.contents("/bob/.profile"), None);
}

#[tokio::test]
async fn test_frames_are_pulled_until_stop() {
    let (alice, _bob) = peers_with(Arc::new(StaticFrameProvider::new(vec![0xFF, 0xD8, 0xFF])), 1024);

    let (tx, mut frames) = mpsc::unbounded_channel();
    let mut remaining = 3;
    let stream = alice
        .client
        .request_frames(75, move |frame| {
            let _ = tx.send(frame);
            remaining -= 1;
            if remaining == 0 {
                FrameControl::Stop
            } else {
                FrameControl::Continue
            }
        })
        .expect("start");

    for _ in 0..3 {
        let frame = timeout(WAIT, frames.recv())
            .await
            .expect("timed out")
            .expect("frame");
        assert_eq!(frame, Ok(vec![0xFF, 0xD8, 0xFF]));
    }
    assert!(!stream.is_active());
    assert!(
        timeout(Duration::from_millis(200), frames.recv()).await.map_or(true, |f| f.is_none()),
        "no frame may be delivered after stop"
    );
}

#[tokio::test]
async fn test_capture_error_reaches_requester_and_cancel_ends_stream() {
    let (alice, _bob) = peers();

    let (tx, mut frames) = mpsc::unbounded_channel();
    let stream = alice
        .client
        .request_frames_default(move |frame| {
            let _ = tx.send(frame);
            FrameControl::Continue
        })
        .expect("start");

    let first = timeout(WAIT, frames.recv())
        .await
        .expect("timed out")
        .expect("frame");
    assert!(matches!(first, Err(ref e) if e.contains("not available")));

    stream.cancel();
    assert!(!stream.is_active());
    assert!(alice.client.connection().callbacks().is_empty());
}

#[tokio::test]
async fn test_generic_call_round_trip() {
    let (alice, mut bob) = peers();

    let call = tokio::spawn({
        let client = alice.client.clone();
        async move {
            client
                .call::<AddRequest, AddResponse>(&AddRequest { a: 2, b: 40 })
                .await
        }
    });

    match bob.next_event().await {
        ClientEvent::GenericRequest(request) => {
            assert!(request.holds::<AddRequest>());
            let AddRequest { a, b } = request.open().expect("open");
            request.respond(&AddResponse { sum: a + b }).expect("respond");
        }
        other => panic!("expected a generic request, got {other:?}"),
    }

    assert_eq!(
        call.await.expect("join").expect("call"),
        AddResponse { sum: 42 }
    );
}

#[tokio::test]
async fn test_generic_failure_is_reported_to_caller() {
    let (alice, mut bob) = peers();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let id = alice
        .client
        .send_generic_request::<AddRequest, AddResponse, _>(&AddRequest { a: 1, b: 1 }, move |result| {
            let _ = tx.send(result);
        })
        .expect("send");

    match bob.next_event().await {
        ClientEvent::GenericRequest(request) => {
            assert_eq!(request.correlation_id(), id, "inner request keeps the envelope's id");
            request.fail("division by zero").expect("fail");
        }
        other => panic!("expected a generic request, got {other:?}"),
    }

    let result = timeout(WAIT, rx).await.expect("timed out").expect("reply");
    assert!(matches!(result, Err(ClientError::Remote(ref e)) if e == "division by zero"));
}

#[tokio::test]
async fn test_text_message_arrives_unmodified() {
    let (alice, mut bob) = peers();
    alice.client.send_text("hello bob, ünïcode ✓").expect("send");

    match bob.next_event().await {
        ClientEvent::TextMessage(text) => assert_eq!(text, "hello bob, ünïcode ✓"),
        other => panic!("expected a text message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_refused_invitation_reaches_requester_continuation() {
    let (alice, mut bob) = peers();

    let (tx, rx) = tokio::sync::oneshot::channel();
    alice
        .client
        .request_session_with("bob", move |reply| {
            let _ = tx.send(reply);
        })
        .expect("request");

    match bob.next_event().await {
        ClientEvent::SessionRequested(invitation) => {
            assert_eq!(invitation.requester(), "bob");
            invitation.refuse().expect("refuse");
        }
        other => panic!("expected a session invitation, got {other:?}"),
    }

    let reply = timeout(WAIT, rx).await.expect("timed out").expect("reply");
    assert!(!reply.body.is_confirmed);
    assert_eq!(alice.client.status(), relay_core::Status::Connected);
}

#[tokio::test]
async fn test_confirm_requires_login() {
    let (alice, mut bob) = peers();
    alice.client.request_session_with("bob", |_| {}).expect("request");

    match bob.next_event().await {
        ClientEvent::SessionRequested(invitation) => {
            assert!(matches!(invitation.confirm(), Err(ClientError::Status(_))));
        }
        other => panic!("expected a session invitation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_is_reported_to_both_sides() {
    let (mut alice, mut bob) = peers();
    alice.client.disconnect();

    // Bob first sees the DisconnectRequest, then his own connection closing.
    assert!(matches!(bob.next_event().await, ClientEvent::PeerDisconnected));
    assert!(matches!(bob.next_event().await, ClientEvent::Disconnected));
    assert!(matches!(alice.next_event().await, ClientEvent::Disconnected));
}
