//! Time adapter.
//!
//! Two clocks are in play:
//!
//! - **monotonic** milliseconds since start, driving idle watchdogs,
//!   partial-frame expiry and heartbeats;
//! - **wall clock** milliseconds since the Unix epoch, answered to `0x03`
//!   and settable by the host.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic clock shared by reader threads and the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds since the clock was created.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }
}

/// Milliseconds since the Unix epoch; zero if the system clock is before it.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
