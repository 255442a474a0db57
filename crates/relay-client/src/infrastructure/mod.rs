//! Infrastructure layer for the client application.
//!
//! Contains OS-facing adapters: the TCP connect and the collaborators the
//! transfer and frame-stream protocols run against.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `relay_core`, but MUST NOT be imported by the `application` layer (tests
//! excepted).
//!
//! # Sub-modules
//!
//! - **`network`** – Opens the TCP stream to the relay server and starts a
//!   `RelayClient` over it.
//!
//! - **`file_store`** – `FileStore` implementations: the local file system and
//!   an in-memory store for tests.
//!
//! - **`frame_provider`** – `FrameProvider` implementations: one that refuses
//!   every request and one that serves a fixed frame.

pub mod file_store;
pub mod frame_provider;
pub mod network;
