//! membership-core: peer-to-peer cluster membership.
//!
//! This crate provides:
//! - A sans-IO agent that schedules commands, protocol messages and timers
//! - Gossip anti-entropy over versioned node state and headers
//! - Phi-accrual failure detection with evasive/expired deadlines
//! - An all-to-all ping strategy as a simpler alternative to gossip
//! - Transport and codec abstractions, with an in-memory network for tests

pub mod agent;
pub mod clock;
pub mod config;
pub mod control;
pub mod events;
pub mod gossip;
pub mod handler;
pub mod heartbeat;
pub mod peer;
pub mod protocol;
pub mod state;
pub mod system;
pub mod transport;
pub mod versioned;

/// Network address of a node.
pub type Endpoint = std::net::SocketAddr;

pub use agent::{Agent, AgentError, Context};
pub use config::{Config, ConfigError};
pub use control::ControlMessage;
pub use events::PeerEvent;
pub use gossip::{FailureDetector, Gossiper};
pub use handler::{Handler, HandlerId};
pub use heartbeat::HeartBeater;
pub use peer::{Peer, PeerRegistry};
pub use protocol::{Codec, Envelope, Handshake};
pub use state::NodeState;
pub use transport::{Delivery, Link, MemoryNetwork, Transport, TransportError};
pub use versioned::{VersionedMap, VersionedValue};
