//! Wall-clock helpers.
//!
//! Protocol code takes `now_ms` as a parameter; only the runtime that
//! drives an agent reads the clock.

use web_time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch, truncated to 32 bits.
///
/// Used as the default generation: it grows across restarts.
pub fn unix_seconds() -> u32 {
    (now_ms() / 1000) as u32
}
