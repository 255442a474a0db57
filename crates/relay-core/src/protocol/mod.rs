//! Protocol module containing message types, the binary codec and the
//! generic envelope.

pub mod codec;
pub mod envelope;
pub mod messages;

pub use codec::{decode_message, encode_message, encode_message_now, peek_frame_header, FrameHeader, ProtocolError};
pub use envelope::{EnvelopeError, EnvelopePayload, GenericEnvelope};
pub use messages::*;
