//! All-to-all heartbeat messages.
//!
//! Every message carries the sender's frame number on the link it came
//! over, starting at 1 for a fresh link.

use crate::Endpoint;
use crate::protocol::{Codec, CodecError, Envelope, InboundMessage, Protocol, ProtocolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HELLO: u16 = 1;
pub const PING: u16 = 6;
pub const PING_OK: u16 = 7;

pub const HEARTBEAT: Protocol = Protocol {
    name: "heartbeat",
    version: 1,
    kinds: &[HELLO, PING, PING_OK],
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Beat {
    pub sequence: u64,
}

/// Sent to every ready peer when a new one becomes ready.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub sequence: u64,
    /// Every peer the sender has heard back from
    pub peers: Vec<Endpoint>,
    /// The sender's headers, without versions
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatMessage {
    Hello(Hello),
    Ping(Beat),
    PingOk(Beat),
}

impl HeartbeatMessage {
    pub fn ping(sequence: u64) -> Self {
        HeartbeatMessage::Ping(Beat { sequence })
    }

    pub fn ping_ok(sequence: u64) -> Self {
        HeartbeatMessage::PingOk(Beat { sequence })
    }

    pub fn kind(&self) -> u16 {
        match self {
            HeartbeatMessage::Hello(_) => HELLO,
            HeartbeatMessage::Ping(_) => PING,
            HeartbeatMessage::PingOk(_) => PING_OK,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            HeartbeatMessage::Hello(hello) => hello.sequence,
            HeartbeatMessage::Ping(beat) | HeartbeatMessage::PingOk(beat) => beat.sequence,
        }
    }

    pub fn to_envelope(&self, codec: Codec) -> Result<Envelope, CodecError> {
        let kind = self.kind();
        match self {
            HeartbeatMessage::Hello(body) => Envelope::wrap(&HEARTBEAT, kind, body, codec),
            HeartbeatMessage::Ping(body) | HeartbeatMessage::PingOk(body) => {
                Envelope::wrap(&HEARTBEAT, kind, body, codec)
            }
        }
    }

    pub fn from_inbound(message: &InboundMessage) -> Result<Self, ProtocolError> {
        match message.header.kind {
            HELLO => Ok(HeartbeatMessage::Hello(message.decode_body()?)),
            PING => Ok(HeartbeatMessage::Ping(message.decode_body()?)),
            PING_OK => Ok(HeartbeatMessage::PingOk(message.decode_body()?)),
            kind => Err(ProtocolError::UnexpectedKind {
                protocol: HEARTBEAT.name,
                kind,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::GOSSIP;

    fn addr(port: u16) -> Endpoint {
        Endpoint::from(([10, 0, 0, 1], port))
    }

    fn decode(frame: &[u8]) -> HeartbeatMessage {
        let (envelope, codec) = Envelope::decode(frame).unwrap();
        HeartbeatMessage::from_inbound(&InboundMessage {
            from: addr(1),
            header: envelope.header,
            body: envelope.body,
            codec,
        })
        .unwrap()
    }

    #[test]
    fn test_messages_survive_both_codecs() {
        let hello = HeartbeatMessage::Hello(Hello {
            sequence: 3,
            peers: vec![addr(5555), addr(5557)],
            headers: BTreeMap::from([("zone".to_string(), "eu".to_string())]),
        });
        for codec in [Codec::Bincode, Codec::Json] {
            for message in [hello.clone(), HeartbeatMessage::ping(1), HeartbeatMessage::ping_ok(2)] {
                let frame = message.to_envelope(codec).unwrap().encode(codec).unwrap();
                assert_eq!(decode(&frame), message, "codec {}", codec);
            }
        }
    }

    #[test]
    fn test_heartbeat_is_its_own_protocol() {
        let envelope = HeartbeatMessage::ping(1).to_envelope(Codec::Bincode).unwrap();
        assert_eq!(envelope.header.signature, HEARTBEAT.signature());
        assert_ne!(HEARTBEAT.signature(), GOSSIP.signature());
        assert_eq!(envelope.header.kind, PING);
    }

    #[test]
    fn test_gossip_kind_is_rejected() {
        let message = InboundMessage {
            from: addr(1),
            header: crate::protocol::Header {
                version: 1,
                signature: HEARTBEAT.signature(),
                kind: 8,
            },
            body: Vec::new(),
            codec: Codec::Bincode,
        };
        assert!(matches!(
            HeartbeatMessage::from_inbound(&message),
            Err(ProtocolError::UnexpectedKind { kind: 8, .. })
        ));
    }
}
