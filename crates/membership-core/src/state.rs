//! Per-node protocol state.

use crate::Endpoint;
use crate::versioned::VersionedMap;
use serde::{Deserialize, Serialize};

/// What the membership protocol knows about one node.
///
/// Headers are stored next to the state (on the agent for the local node,
/// on the [`Peer`](crate::Peer) for remote ones), so the effective version
/// takes them as a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub endpoint: Endpoint,
    /// Restart counter. Dominates `version` when comparing histories.
    pub generation: u32,
    /// Heartbeat counter
    pub version: u64,
    pub alive: bool,
    /// Sticky flag exempting the node from liveness eviction
    pub managing: bool,
}

impl NodeState {
    pub fn new(endpoint: Endpoint, generation: u32, version: u64) -> Self {
        Self {
            endpoint,
            generation,
            version,
            alive: true,
            managing: false,
        }
    }

    /// `max(version, headers.max_version())`
    pub fn effective_version(&self, headers: &VersionedMap) -> u64 {
        self.version.max(headers.max_version())
    }

    /// Advance the heartbeat past anything already published.
    pub fn beat(&mut self, headers: &VersionedMap) -> u64 {
        self.version = self.effective_version(headers) + 1;
        self.version
    }

    /// Serialize for event payloads.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("NodeState serialization should not fail")
    }
}
