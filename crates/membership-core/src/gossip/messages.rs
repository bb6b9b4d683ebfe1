//! Gossip protocol messages.
//!
//! One anti-entropy round is three messages:
//! 1. `Ping` carries a digest of every node the sender knows
//! 2. `PingAck` requests states the receiver is missing and responds with
//!    states the sender is missing
//! 3. `PingEnd` answers the requests
//!
//! `Hello` greets a seed at startup and `Exit` says goodbye.

use crate::Endpoint;
use crate::protocol::{Codec, CodecError, Envelope, InboundMessage, Protocol, ProtocolError};
use crate::versioned::VersionedMap;
use serde::{Deserialize, Serialize};

pub const HELLO: u16 = 1;
pub const PING: u16 = 8;
pub const PING_ACK: u16 = 9;
pub const PING_END: u16 = 10;
pub const EXIT: u16 = 11;

/// The gossip protocol as registered with an agent.
pub const GOSSIP: Protocol = Protocol {
    name: "gossip",
    version: 1,
    kinds: &[HELLO, PING, PING_ACK, PING_END, EXIT],
};

/// One versioned header carried in a state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderEntry {
    pub key: String,
    pub version: u64,
    pub value: String,
}

/// A node's state on the wire.
///
/// In a digest `extra` is empty; in responses it holds the headers newer
/// than what the other side asked for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateDigest {
    pub address: Endpoint,
    pub generation: u32,
    pub max_version: u64,
    pub extra: Vec<HeaderEntry>,
}

impl StateDigest {
    /// A digest entry without payload.
    pub fn summary(address: Endpoint, generation: u32, max_version: u64) -> Self {
        Self {
            address,
            generation,
            max_version,
            extra: Vec::new(),
        }
    }

    /// A state carrying every header newer than `since`, sorted by key.
    pub fn with_headers(
        address: Endpoint,
        generation: u32,
        max_version: u64,
        headers: &VersionedMap,
        since: u64,
    ) -> Self {
        let mut extra: Vec<HeaderEntry> = headers
            .newer_than(since)
            .map(|(key, v)| HeaderEntry {
                key: key.clone(),
                version: v.version,
                value: v.value.clone(),
            })
            .collect();
        extra.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            address,
            generation,
            max_version,
            extra,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub address: Endpoint,
    pub generation: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub states: Vec<StateDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingAck {
    /// States we want from the other side
    pub request: Vec<StateDigest>,
    /// States the other side is missing
    pub response: Vec<StateDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    Hello(Hello),
    Ping(Digest),
    PingAck(PingAck),
    PingEnd(Digest),
    Exit,
}

impl GossipMessage {
    pub fn ping(states: Vec<StateDigest>) -> Self {
        GossipMessage::Ping(Digest { states })
    }

    pub fn ping_end(states: Vec<StateDigest>) -> Self {
        GossipMessage::PingEnd(Digest { states })
    }

    pub fn kind(&self) -> u16 {
        match self {
            GossipMessage::Hello(_) => HELLO,
            GossipMessage::Ping(_) => PING,
            GossipMessage::PingAck(_) => PING_ACK,
            GossipMessage::PingEnd(_) => PING_END,
            GossipMessage::Exit => EXIT,
        }
    }

    pub fn to_envelope(&self, codec: Codec) -> Result<Envelope, CodecError> {
        let kind = self.kind();
        match self {
            GossipMessage::Hello(body) => Envelope::wrap(&GOSSIP, kind, body, codec),
            GossipMessage::Ping(body) | GossipMessage::PingEnd(body) => {
                Envelope::wrap(&GOSSIP, kind, body, codec)
            }
            GossipMessage::PingAck(body) => Envelope::wrap(&GOSSIP, kind, body, codec),
            GossipMessage::Exit => Envelope::wrap(&GOSSIP, kind, &(), codec),
        }
    }

    pub fn from_inbound(message: &InboundMessage) -> Result<Self, ProtocolError> {
        match message.header.kind {
            HELLO => Ok(GossipMessage::Hello(message.decode_body()?)),
            PING => Ok(GossipMessage::Ping(message.decode_body()?)),
            PING_ACK => Ok(GossipMessage::PingAck(message.decode_body()?)),
            PING_END => Ok(GossipMessage::PingEnd(message.decode_body()?)),
            EXIT => Ok(GossipMessage::Exit),
            kind => Err(ProtocolError::UnexpectedKind {
                protocol: GOSSIP.name,
                kind,
            }),
        }
    }
}
