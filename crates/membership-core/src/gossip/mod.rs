//! Gossip-based membership.
//!
//! - [`messages`]: the wire protocol
//! - [`failure`]: phi-accrual failure detection
//! - [`gossiper`]: the `gossip` heartbeat strategy tying them together

pub mod failure;
pub mod gossiper;
pub mod messages;

pub use failure::{ArrivalWindow, FailureDetector, FailureDetectorConfig};
pub use gossiper::{Gossiper, STATUS_HEADER};
pub use messages::{GOSSIP, GossipMessage, HeaderEntry, StateDigest};
