//! Peer lifecycle events.
//!
//! Handlers emit events through the agent context; the agent hands each one
//! to every registered event handler after the emitting handler returns.

use crate::Endpoint;
use crate::control::ControlMessage;
use crate::state::NodeState;
use serde::Serialize;

pub const PEER_ENTER: &str = "PEER.ENTER";
pub const PEER_EXIT: &str = "PEER.EXIT";
pub const PEER_ALIVE: &str = "PEER.ALIVE";
pub const PEER_DEAD: &str = "PEER.DEAD";
pub const PEER_RESTART: &str = "PEER.RESTART";
pub const PEER_HEADER: &str = "PEER.HEADER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerEvent {
    /// A node was discovered.
    Enter { endpoint: Endpoint },
    /// A node was evicted or said goodbye.
    Exit { endpoint: Endpoint },
    /// A node is reachable again (or for the first time).
    Alive { endpoint: Endpoint, state: NodeState },
    /// A node was convicted by the failure detector or is managing.
    Dead { endpoint: Endpoint, state: NodeState },
    /// A node came back with a newer generation.
    Restart { endpoint: Endpoint },
    /// A node's header changed.
    Header {
        endpoint: Endpoint,
        key: String,
        value: String,
    },
}

impl PeerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::Enter { .. } => PEER_ENTER,
            PeerEvent::Exit { .. } => PEER_EXIT,
            PeerEvent::Alive { .. } => PEER_ALIVE,
            PeerEvent::Dead { .. } => PEER_DEAD,
            PeerEvent::Restart { .. } => PEER_RESTART,
            PeerEvent::Header { .. } => PEER_HEADER,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            PeerEvent::Enter { endpoint }
            | PeerEvent::Exit { endpoint }
            | PeerEvent::Alive { endpoint, .. }
            | PeerEvent::Dead { endpoint, .. }
            | PeerEvent::Restart { endpoint }
            | PeerEvent::Header { endpoint, .. } => *endpoint,
        }
    }

    /// Render as a control message for the application.
    ///
    /// `PEER.HEADER endpoint key value`, `PEER.ALIVE endpoint state-json`,
    /// and `NAME endpoint` for the rest.
    pub fn to_message(&self) -> ControlMessage {
        let msg = ControlMessage::new(self.name()).push_str(&self.endpoint().to_string());
        match self {
            PeerEvent::Alive { state, .. } | PeerEvent::Dead { state, .. } => {
                msg.push_str(&state.to_json())
            }
            PeerEvent::Header { key, value, .. } => msg.push_str(key).push_str(value),
            _ => msg,
        }
    }
}
