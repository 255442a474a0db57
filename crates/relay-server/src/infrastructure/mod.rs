//! Infrastructure layer for the relay server.
//!
//! OS-facing adapters: the TCP listener and config-file storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `relay_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
