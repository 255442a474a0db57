//! relay-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does relay-client do?
//!
//! The client connects to a relay server, logs in under an email and either
//! asks for a session with another logged-in client or waits to be asked.
//! Inside a session it can:
//!
//! 1. Exchange text messages.
//! 2. Upload files in fixed-size chunks, each acknowledged by the receiver.
//! 3. Pull encoded screen frames from the peer until it cancels.
//! 4. Make application-defined request/response calls through generic
//!    envelopes.

/// Application layer: the client API and the protocols built on it.
pub mod application;

/// Infrastructure layer: TCP connect and the file/frame adapters.
pub mod infrastructure;

pub use application::client::{ClientError, ClientOptions, ClientServices, RelayClient};
pub use application::events::{ClientEvent, GenericCall, SessionInvitation};
pub use application::frame_stream::{FrameControl, FrameError, FrameProvider, FrameStream};
pub use application::transfer::{
    FileStore, UploadInvitation, UploadProgress, UploadStatus, UPLOAD_REFUSED,
};
pub use infrastructure::network::connect;
