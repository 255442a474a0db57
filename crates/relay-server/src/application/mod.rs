//! Application layer use cases for the relay server.
//!
//! Nothing here touches sockets or the file system; the broker only sees
//! [`relay_core::Connection`]s handed to it by the infrastructure layer.
//!
//! # Sub-modules
//!
//! - **`broker`** – The endpoint registry: login gate, session pairing,
//!   message relay and teardown.
//!
//! - **`login_policy`** – The pluggable accept/refuse decision consulted on
//!   every login attempt.

pub mod broker;
pub mod login_policy;
