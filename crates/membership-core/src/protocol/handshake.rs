//! Transport handshake.
//!
//! The first frame on every outbound link announces the sender's listen
//! address, so the receiving agent knows where replies go. It is JSON sent
//! as a binary frame.

use crate::Endpoint;
use serde::{Deserialize, Serialize};

/// Current transport protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame a transport accepts (16MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const KIND: &str = "handshake";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    /// Where the sender listens for links
    pub address: Endpoint,
}

impl Handshake {
    pub fn new(address: Endpoint) -> Self {
        Self {
            kind: KIND.to_string(),
            version: PROTOCOL_VERSION,
            address,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Handshake serialization should not fail")
    }

    /// `None` for anything that is not a handshake, including gossip frames.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(data)
            .ok()
            .filter(|handshake| handshake.kind == KIND)
    }

    /// A different version is logged, not rejected.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}
