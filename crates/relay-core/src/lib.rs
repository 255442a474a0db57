//! # relay-core
//!
//! Shared library for Relay Sessions containing the message model, the binary
//! wire codec, the endpoint state machine and the connection engine.
//!
//! This crate is used by both the server (`relay-server`) and the client
//! (`relay-client`).
//!
//! # Architecture overview
//!
//! Relay Sessions is a brokered remote-session framework.  Clients connect to
//! a server, log in under an email, and ask the server to pair them with
//! another logged-in client.  Once paired, every message one side sends is
//! relayed verbatim to the other.  File uploads, screen-frame streaming and
//! application-defined request/response calls all ride on that relay.
//!
//! - **`protocol`** – How bytes travel over the network.  Every message is a
//!   frame with a 24-byte header, a stable type name and a payload.  Variants
//!   are resolved by name so peers from different builds interoperate.
//!
//! - **`domain`** – The endpoint lifecycle state machine
//!   (Connected → Validated → InSession, and Disconnected as the terminal
//!   state).
//!
//! - **`transport`** – The [`Connection`] engine used on both sides: one task
//!   writing a FIFO outbound queue, one task reading and dispatching frames,
//!   and a [`CallbackRegistry`] that routes responses to the continuations of
//!   the requests that caused them.

pub mod domain;
pub mod protocol;
pub mod transport;

pub use domain::status::{Status, StatusError};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::envelope::{EnvelopeError, EnvelopePayload, GenericEnvelope};
pub use protocol::messages::{Message, MessageBody, MessageKind};
pub use transport::{
    CallbackError, CallbackRegistry, Connection, ConnectionError, ConnectionOptions,
    MessageHandler, Reply, Role,
};
