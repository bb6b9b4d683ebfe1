//! Agent configuration.
//!
//! Configuration is a flat set of `key=value` properties:
//!
//! ```text
//! # gossip with seed 10.0.0.1
//! bind=0.0.0.0:5555
//! heartbeat.endpoints=10.0.0.1:5555,10.0.0.2:5555
//! heartbeat.interval=1000
//! MANAGING_STATUS=DRAINING,UPGRADING
//! ```
//!
//! Recognized keys are parsed into typed fields; anything else is kept and
//! available through [`Config::get`] for custom handlers.

use crate::Endpoint;
use crate::clock;
use crate::gossip::FailureDetectorConfig;
use crate::protocol::{Codec, CodecError};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const BIND: &str = "bind";
pub const ADVERTISE: &str = "advertise";
pub const HEARTBEAT_STRATEGY: &str = "heartbeat.strategy";
pub const HEARTBEAT_ENDPOINTS: &str = "heartbeat.endpoints";
pub const HEARTBEAT_INTERVAL: &str = "heartbeat.interval";
pub const HEARTBEAT_EVASIVE: &str = "heartbeat.evasive";
pub const HEARTBEAT_EXPIRED: &str = "heartbeat.expired";
pub const HEARTBEAT_GENERATION: &str = "heartbeat.generation";
pub const HEARTBEAT_PHI_THRESHOLD: &str = "heartbeat.phi_threshold";
pub const HEARTBEAT_MAX_INTERVAL: &str = "heartbeat.max_interval";
pub const SEND_HWM: &str = "send.hwm";
pub const WIRE_CODEC: &str = "wire.codec";
pub const LINGER: &str = "linger";
pub const MANAGING_STATUS: &str = "MANAGING_STATUS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Line {line}: expected key=value")]
    InvalidLine { line: usize },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Unknown heartbeat strategy: {0}")]
    UnknownStrategy(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Typed agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the inbox (port 0 picks one)
    pub bind: String,
    /// Address announced to peers (defaults to the bound address)
    pub advertise: Option<Endpoint>,
    pub strategy: String,
    pub seeds: Vec<Endpoint>,
    pub interval_ms: u64,
    pub evasive_ms: u64,
    pub expired_ms: u64,
    pub generation: u32,
    pub phi_threshold: f64,
    pub max_interval_ms: u64,
    /// Outbound queue cap per peer
    pub send_hwm: usize,
    pub codec: Codec,
    /// How long shutdown waits for queued frames to flush
    pub linger_ms: u64,
    /// Status values that exempt a peer from liveness eviction
    pub managing_status: Vec<String>,
    extra: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            advertise: None,
            strategy: "gossip".to_string(),
            seeds: Vec::new(),
            interval_ms: 1000,
            evasive_ms: 5000,
            expired_ms: 10_000,
            generation: clock::unix_seconds(),
            phi_threshold: 8.0,
            max_interval_ms: 10_000,
            send_hwm: 1000,
            codec: Codec::default(),
            linger_ms: 1000,
            managing_status: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

impl Config {
    /// Build from key/value pairs on top of the defaults.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Parse properties text. `#` starts a comment line.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut pairs = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::InvalidLine { line: index + 1 })?;
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        Self::from_pairs(pairs)
    }

    /// Load a properties file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Apply a single key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            BIND => self.bind = value.to_string(),
            ADVERTISE => self.advertise = Some(resolve_endpoint(value)?),
            HEARTBEAT_STRATEGY => self.strategy = value.to_string(),
            HEARTBEAT_ENDPOINTS => self.seeds = parse_endpoints(value)?,
            HEARTBEAT_INTERVAL => self.interval_ms = parse_value(key, value)?,
            HEARTBEAT_EVASIVE => self.evasive_ms = parse_value(key, value)?,
            HEARTBEAT_EXPIRED => self.expired_ms = parse_value(key, value)?,
            HEARTBEAT_GENERATION => self.generation = parse_value(key, value)?,
            HEARTBEAT_PHI_THRESHOLD => self.phi_threshold = parse_value(key, value)?,
            HEARTBEAT_MAX_INTERVAL => self.max_interval_ms = parse_value(key, value)?,
            SEND_HWM => self.send_hwm = parse_value(key, value)?,
            WIRE_CODEC => self.codec = value.parse()?,
            LINGER => self.linger_ms = parse_value(key, value)?,
            MANAGING_STATUS => self.managing_status = split_list(value),
            _ => {
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Look up a key that has no typed field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    /// Look up an untyped key with a fallback.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn failure_detector(&self) -> FailureDetectorConfig {
        FailureDetectorConfig {
            gossip_interval_ms: self.interval_ms,
            convict_threshold: self.phi_threshold,
            max_interval_ms: self.max_interval_ms,
            ..FailureDetectorConfig::default()
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_endpoints(value: &str) -> Result<Vec<Endpoint>, ConfigError> {
    split_list(value)
        .iter()
        .map(|s| resolve_endpoint(s))
        .collect()
}

/// Parse `ip:port`, falling back to name resolution for `host:port`.
pub fn resolve_endpoint(value: &str) -> Result<Endpoint, ConfigError> {
    let value = value.trim();
    if let Ok(endpoint) = value.parse() {
        return Ok(endpoint);
    }
    value
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidEndpoint(value.to_string()))
}
