//! Domain entities for Relay Sessions.
//!
//! Pure state-machine logic with no I/O, shared by the client and the server.

/// Endpoint lifecycle state machine.
pub mod status;

pub use status::{Status, StatusError};
