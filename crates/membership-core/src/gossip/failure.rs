//! Phi-accrual failure detection.
//!
//! Every time fresh state for an endpoint is applied, the gossiper calls
//! `report()`. The detector keeps a sliding window of inter-arrival
//! intervals per endpoint and turns the time since the last arrival into a
//! suspicion level:
//!
//! ```text
//! phi(now) = log10(e) * (now - last_arrival) / mean(window)
//! ```
//!
//! An endpoint is convicted once phi exceeds the configured threshold.

use crate::Endpoint;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::LOG10_E;
use tracing::trace;

/// Maximum number of intervals kept per endpoint.
pub const SAMPLE_SIZE: usize = 1000;

/// Configuration for the phi-accrual detector.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// Gossip interval in ms. Seeds the first sample as half of this.
    pub gossip_interval_ms: u64,
    /// Phi above which an endpoint is suspected (default: 8.0)
    pub convict_threshold: f64,
    /// Intervals longer than this are not recorded (default: 10s)
    pub max_interval_ms: u64,
    /// Window capacity (default: 1000)
    pub sample_size: usize,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 1000,
            convict_threshold: 8.0,
            max_interval_ms: 10_000,
            sample_size: SAMPLE_SIZE,
        }
    }
}

/// Bounded ring of inter-arrival intervals for one endpoint.
#[derive(Debug, Clone)]
pub struct ArrivalWindow {
    intervals: VecDeque<u64>,
    last_arrival: Option<u64>,
    capacity: usize,
}

impl ArrivalWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            intervals: VecDeque::with_capacity(capacity.min(64)),
            last_arrival: None,
            capacity: capacity.max(1),
        }
    }

    fn add(&mut self, now_ms: u64, config: &FailureDetectorConfig) {
        let interval = match self.last_arrival {
            Some(last) => now_ms.saturating_sub(last),
            None => config.gossip_interval_ms / 2,
        };
        if interval <= config.max_interval_ms {
            if self.intervals.len() == self.capacity {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval);
        }
        self.last_arrival = Some(now_ms);
    }

    /// Mean of the recorded intervals, if any.
    pub fn mean(&self) -> Option<f64> {
        if self.intervals.is_empty() {
            return None;
        }
        let sum: u64 = self.intervals.iter().sum();
        Some(sum as f64 / self.intervals.len() as f64)
    }

    pub fn phi(&self, now_ms: u64) -> f64 {
        let (Some(mean), Some(last)) = (self.mean(), self.last_arrival) else {
            return 0.0;
        };
        let elapsed = now_ms.saturating_sub(last) as f64;
        if mean <= 0.0 {
            return if elapsed > 0.0 { f64::INFINITY } else { 0.0 };
        }
        LOG10_E * elapsed / mean
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn last_arrival(&self) -> Option<u64> {
        self.last_arrival
    }

    fn clear(&mut self) {
        self.intervals.clear();
    }
}

/// Phi-accrual failure detector keyed by endpoint.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    windows: HashMap<Endpoint, ArrivalWindow>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Record a heartbeat arrival for an endpoint.
    pub fn report(&mut self, endpoint: Endpoint, now_ms: u64) {
        let capacity = self.config.sample_size;
        self.windows
            .entry(endpoint)
            .or_insert_with(|| ArrivalWindow::new(capacity))
            .add(now_ms, &self.config);
    }

    /// Current suspicion level for an endpoint (0 when unknown).
    pub fn phi(&self, endpoint: &Endpoint, now_ms: u64) -> f64 {
        self.windows
            .get(endpoint)
            .map(|w| w.phi(now_ms))
            .unwrap_or(0.0)
    }

    /// Whether the endpoint should be convicted.
    pub fn interpret(&self, endpoint: &Endpoint, now_ms: u64) -> bool {
        let phi = self.phi(endpoint, now_ms);
        trace!("phi for {} is {:.3}", endpoint, phi);
        phi > self.config.convict_threshold
    }

    /// Forget the interval history but keep tracking the endpoint.
    pub fn clear(&mut self, endpoint: &Endpoint) {
        if let Some(window) = self.windows.get_mut(endpoint) {
            window.clear();
        }
    }

    /// Forget the endpoint entirely.
    pub fn remove(&mut self, endpoint: &Endpoint) {
        self.windows.remove(endpoint);
    }

    pub fn window(&self, endpoint: &Endpoint) -> Option<&ArrivalWindow> {
        self.windows.get(endpoint)
    }

    pub fn is_tracking(&self, endpoint: &Endpoint) -> bool {
        self.windows.contains_key(endpoint)
    }
}
