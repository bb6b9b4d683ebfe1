//! Wire protocol between agents.
//!
//! - Transport handshake announcing the sender's address
//! - Envelopes with protocol signature, version and message kind
//! - Pluggable codec (bincode or JSON)

pub mod codec;
pub mod envelope;
pub mod handshake;

pub use codec::{Codec, CodecError};
pub use envelope::{
    Envelope, Header, InboundMessage, MessageRegistry, Protocol, ProtocolError, Signature,
};
pub use handshake::{Handshake, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
