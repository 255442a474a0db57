//! relay-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::broker::{BrokerEvent, EndpointInfo, SessionBroker};
pub use application::login_policy::{policy_for, AllowAll, AllowList, LoginDecision, LoginPolicy};
pub use infrastructure::network::RelayListener;
