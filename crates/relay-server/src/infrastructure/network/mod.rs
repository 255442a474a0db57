//! Network infrastructure for the relay server.
//!
//! # Sub-modules
//!
//! - **`listener`** – Binds the TCP listening socket and hands every accepted
//!   stream to the [`SessionBroker`](crate::application::broker::SessionBroker)
//!   as a new endpoint.

pub mod listener;

pub use listener::{NetworkError, RelayListener};
