//! Transport layer: the connection engine and its callback registry.

pub mod callbacks;
pub mod connection;

pub use callbacks::{CallbackError, CallbackRegistry, Reply};
pub use connection::{
    Connection, ConnectionError, ConnectionOptions, MalformedFramePolicy, MessageHandler,
    NullHandler, Role,
};
