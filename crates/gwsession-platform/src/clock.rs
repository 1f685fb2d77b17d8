//! Wall-clock sources.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant as TokioInstant;

/// Source of "now" in Unix milliseconds.
///
/// Everything time-dependent in gwsession reads the clock through this
/// trait instead of calling `SystemTime::now()` directly, so the state
/// machines can run against a controllable clock in tests.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Whole seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// The operating system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A wall clock that advances with Tokio's clock.
///
/// Anchored to a Unix timestamp at construction, it then moves forward
/// exactly as `tokio::time::Instant` does. Under
/// `#[tokio::test(start_paused = true)]` this makes wall-clock reads follow
/// `tokio::time::advance`, so timer, lease and heartbeat logic can be tested
/// without real sleeps.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_ms: u64,
    origin: TokioInstant,
}

impl TokioClock {
    /// Anchors the clock at `origin_ms` (Unix milliseconds).
    pub fn new(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            origin: TokioInstant::now(),
        }
    }

    /// Anchors the clock at the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_ms())
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}
