//! Application layer use cases for the client application.
//!
//! # What use cases does the client have?
//!
//! - **`client`** – `RelayClient`: login, session request/end, text, uploads,
//!   frame pulls and generic calls, each as a continuation or an awaitable.
//!
//! - **`dispatch`** – Routes every inbound message: responses to their
//!   continuations, peer requests to events or protocol handlers.
//!
//! - **`events`** – The `ClientEvent` stream and the handles that answer
//!   session invitations and generic calls.
//!
//! - **`transfer`** – The chunked upload protocol, both sides, and the
//!   `FileStore` collaborator it runs against.
//!
//! - **`frame_stream`** – The frame pull loop, both sides, and the
//!   `FrameProvider` collaborator.

pub mod client;
pub(crate) mod dispatch;
pub mod events;
pub mod frame_stream;
pub mod transfer;
