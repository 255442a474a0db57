//! Generic envelope for application-defined message types.
//!
//! The broker and the transport only see a type name and an opaque byte
//! payload.  Applications declare their own request/response structs, give
//! each a stable [`EnvelopePayload::TYPE_NAME`], and let the envelope carry
//! them as bincode-encoded bytes:
//!
//! ```rust
//! use relay_core::protocol::envelope::{EnvelopePayload, GenericEnvelope};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct AddRequest { a: i64, b: i64 }
//!
//! impl EnvelopePayload for AddRequest {
//!     const TYPE_NAME: &'static str = "calc.AddRequest";
//! }
//!
//! let envelope = GenericEnvelope::wrap(&AddRequest { a: 2, b: 3 }).unwrap();
//! assert!(envelope.holds::<AddRequest>());
//! assert_eq!(envelope.open::<AddRequest>().unwrap(), AddRequest { a: 2, b: 3 });
//! ```
//!
//! The envelope has no correlation id of its own: the inner value is always
//! delivered with the correlation id of the [`Message`](super::messages::Message)
//! that carries the envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while wrapping or opening an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope holds a different application type.
    #[error("envelope holds {found}, expected {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("envelope payload could not be encoded or decoded: {0}")]
    Serialization(#[from] bincode::Error),
}

/// An application-defined type that can travel inside a [`GenericEnvelope`].
pub trait EnvelopePayload: Serialize + DeserializeOwned {
    /// Stable name used to resolve the payload type on the receiving side.
    const TYPE_NAME: &'static str;
}

/// Opaque wrapper routed by the broker without knowledge of its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericEnvelope {
    pub type_name: String,
    pub payload: Vec<u8>,
}

impl GenericEnvelope {
    /// Serializes `value` into a new envelope.
    pub fn wrap<T: EnvelopePayload>(value: &T) -> Result<Self, EnvelopeError> {
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            payload: bincode::serialize(value)?,
        })
    }

    /// Returns `true` when the envelope was produced from a `T`.
    pub fn holds<T: EnvelopePayload>(&self) -> bool {
        self.type_name == T::TYPE_NAME
    }

    /// Deserializes the payload as a `T`.
    ///
    /// Trailing bytes appended by a newer revision of `T` are ignored.
    pub fn open<T: EnvelopePayload>(&self) -> Result<T, EnvelopeError> {
        if !self.holds::<T>() {
            return Err(EnvelopeError::TypeMismatch {
                expected: T::TYPE_NAME,
                found: self.type_name.clone(),
            });
        }
        Ok(bincode::deserialize(&self.payload)?)
    }
}
