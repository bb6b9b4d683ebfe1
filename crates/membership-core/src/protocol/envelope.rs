//! Message envelopes and the protocol registry.
//!
//! Every frame exchanged between agents is an [`Envelope`]: a small header
//! naming the protocol (by signature), its version and the message kind,
//! followed by a body encoded with the same codec as the envelope.

use super::codec::{Codec, CodecError};
use crate::Endpoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// 32-bit protocol signature (FNV-1a of the protocol name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub u32);

impl Signature {
    pub const fn of(name: &str) -> Self {
        Signature(fnv1a_hash(name.as_bytes()))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// FNV-1a 32-bit hash.
const fn fnv1a_hash(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;

    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < data.len() {
        hash ^= data[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// A message protocol a handler can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub name: &'static str,
    pub version: u8,
    /// Message kinds this protocol accepts.
    pub kinds: &'static [u16],
}

impl Protocol {
    pub const fn signature(&self) -> Signature {
        Signature::of(self.name)
    }

    pub fn accepts(&self, kind: u16) -> bool {
        self.kinds.contains(&kind)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] CodecError),

    #[error("Unknown protocol signature: {0}")]
    UnknownSignature(Signature),

    #[error("Unexpected message kind {kind} for protocol {protocol}")]
    UnexpectedKind { protocol: &'static str, kind: u16 },
}

/// Envelope header. `version` comes first so bincode frames never start
/// with `{`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub signature: Signature,
    pub kind: u16,
}

/// A framed message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Encode `body` and wrap it for `protocol`.
    pub fn wrap<T: Serialize>(
        protocol: &Protocol,
        kind: u16,
        body: &T,
        codec: Codec,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            header: Header {
                version: protocol.version,
                signature: protocol.signature(),
                kind,
            },
            body: codec.encode(body)?,
        })
    }

    pub fn encode(&self, codec: Codec) -> Result<Vec<u8>, CodecError> {
        codec.encode(self)
    }

    /// Decode a frame, detecting its codec.
    pub fn decode(frame: &[u8]) -> Result<(Self, Codec), CodecError> {
        let codec = Codec::detect(frame).ok_or(CodecError::Empty)?;
        Ok((codec.decode(frame)?, codec))
    }
}

/// An envelope delivered to a callback handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Address the sender announced when it connected.
    pub from: Endpoint,
    pub header: Header,
    pub body: Vec<u8>,
    /// Codec the envelope arrived in. The body uses the same one.
    pub codec: Codec,
}

impl InboundMessage {
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(self.codec.decode(&self.body)?)
    }
}

/// Signature → protocol table owned by one agent.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    protocols: HashMap<Signature, Protocol>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol, returning the one it replaced.
    pub fn register(&mut self, protocol: Protocol) -> Option<Protocol> {
        self.protocols.insert(protocol.signature(), protocol)
    }

    pub fn get(&self, signature: Signature) -> Option<&Protocol> {
        self.protocols.get(&signature)
    }

    /// Check a header against the registered protocols.
    pub fn validate(&self, header: &Header) -> Result<&Protocol, ProtocolError> {
        let protocol = self
            .protocols
            .get(&header.signature)
            .ok_or(ProtocolError::UnknownSignature(header.signature))?;

        if header.version != protocol.version {
            warn!(
                "Protocol {} version mismatch: ours {}, theirs {}",
                protocol.name, protocol.version, header.version
            );
        }

        if !protocol.accepts(header.kind) {
            return Err(ProtocolError::UnexpectedKind {
                protocol: protocol.name,
                kind: header.kind,
            });
        }
        Ok(protocol)
    }
}
