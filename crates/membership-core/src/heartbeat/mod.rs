//! Heartbeat strategies.
//!
//! `heartbeat.strategy` picks the handler that owns peer liveness:
//! - `gossip` ([`Gossiper`]): anti-entropy over versioned state with phi-accrual detection
//! - `all` ([`HeartBeater`]): every node pings every peer it knows

pub mod beater;
pub mod messages;

pub use beater::HeartBeater;
pub use messages::{HEARTBEAT, HeartbeatMessage};

use crate::config::{Config, ConfigError};
use crate::gossip::Gossiper;
use crate::handler::Handler;

/// Build the heartbeat handler named by `heartbeat.strategy`.
pub fn create_heartbeat(config: &Config) -> Result<Box<dyn Handler>, ConfigError> {
    match config.strategy.as_str() {
        "gossip" => Ok(Box::new(Gossiper::new(config))),
        "all" => Ok(Box::new(HeartBeater::new(config))),
        other => Err(ConfigError::UnknownStrategy(other.to_string())),
    }
}
