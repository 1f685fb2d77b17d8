//! Wall-clock countdown for gwsession.
//!
//! The timer never counts ticks. Every tick recomputes the remaining time
//! as `expires_at - now` from the platform [`Clock`], so a throttled
//! background tab or a laptop coming back from sleep shows the right value
//! on its very next tick.
//!
//! # Integration
//!
//! The engine is a plain state machine ([`TimerEngine::tick`] returns the
//! events to act on) with an async tick source for the orchestrator's
//! `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         events = timer.wait_for_tick() => {
//!             for event in events { /* Tick / Warning / Expired */ }
//!         }
//!         Some(cmd) = cmd_rx.recv() => { /* pause, resume, reconcile, ... */ }
//!     }
//! }
//! ```
//!
//! While stopped, paused or expired, [`TimerEngine::wait_for_tick`] pends
//! forever, which `select!` treats as "this branch is idle".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gwsession_platform::{Clock, Visibility};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timer behaviour.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Remaining seconds at which the warning fires. 0 disables it.
    ///
    /// Default: 300.
    pub warning_threshold_seconds: u64,

    /// Pause automatically while the page is hidden.
    ///
    /// Default: false.
    pub pause_on_hidden: bool,

    /// Server corrections smaller than this are ignored.
    ///
    /// Default: 2 seconds.
    pub clock_skew_tolerance_seconds: u64,

    /// How often the display value is recomputed.
    ///
    /// Default: 1 second.
    pub tick_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            warning_threshold_seconds: 300,
            pause_on_hidden: false,
            clock_skew_tolerance_seconds: 2,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl TimerConfig {
    /// Largest accepted skew tolerance.
    pub const MAX_SKEW_TOLERANCE_SECONDS: u64 = 60;

    /// Clamps out-of-range values. Called by [`TimerEngine::new`].
    ///
    /// - `tick_interval` of zero becomes 1 second.
    /// - `clock_skew_tolerance_seconds` is capped at
    ///   [`Self::MAX_SKEW_TOLERANCE_SECONDS`].
    pub fn validated(mut self) -> Self {
        if self.tick_interval.is_zero() {
            warn!("tick_interval is zero, using 1s");
            self.tick_interval = Duration::from_secs(1);
        }
        if self.clock_skew_tolerance_seconds > Self::MAX_SKEW_TOLERANCE_SECONDS {
            warn!(
                tolerance = self.clock_skew_tolerance_seconds,
                max = Self::MAX_SKEW_TOLERANCE_SECONDS,
                "clock_skew_tolerance_seconds too large, clamping"
            );
            self.clock_skew_tolerance_seconds = Self::MAX_SKEW_TOLERANCE_SECONDS;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Status, events, errors
// ---------------------------------------------------------------------------

/// Where the timer is in its lifecycle.
///
/// ```text
/// Stopped ──start──→ Running ──pause──→ Paused
///                      │  ↑──resume──────┘
///                      └──tick, remaining = 0──→ Expired (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Stopped,
    Running,
    Paused,
    Expired,
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Who paused the timer. Only a visibility pause is undone by the page
/// becoming visible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOrigin {
    Explicit,
    Visibility,
}

/// What a tick produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Emitted on every tick while running.
    Tick { remaining_seconds: u64 },
    /// First tick at or below the warning threshold. Once per arming.
    Warning { remaining_seconds: u64 },
    /// Remaining time reached zero. Exactly once.
    Expired,
}

/// A correction applied by [`TimerEngine::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Remaining seconds before the correction.
    pub previous: u64,
    /// Remaining seconds after it.
    pub applied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer already started (status: {0})")]
    AlreadyStarted(TimerStatus),

    #[error("timer is not running (status: {0})")]
    NotRunning(TimerStatus),

    #[error("timer is not paused (status: {0})")]
    NotPaused(TimerStatus),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Countdown towards a session's expiry.
///
/// All instants are Unix milliseconds from the injected clock. Remaining
/// time is reported in whole seconds, rounded up, so the display reaches
/// `00:00` exactly when the session expires.
pub struct TimerEngine {
    config: TimerConfig,
    clock: Arc<dyn Clock>,
    status: TimerStatus,
    /// Effective expiry while running.
    expires_at_ms: Option<u64>,
    started_at_ms: Option<u64>,
    /// Remaining time frozen by a pause.
    frozen_ms: u64,
    pause_origin: Option<PauseOrigin>,
    warning_fired: bool,
    /// Lowest value reported since the last correction. Keeps the display
    /// from climbing when the wall clock steps backwards.
    floor: Option<u64>,
    ticker: Option<Interval>,
}

impl TimerEngine {
    /// Upper bound on the remaining time the engine will hold, one year.
    /// Expiries and corrections beyond it are clamped.
    pub const MAX_REMAINING_SECONDS: u64 = 366 * 24 * 60 * 60;

    pub fn new(config: TimerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.validated(),
            clock,
            status: TimerStatus::Stopped,
            expires_at_ms: None,
            started_at_ms: None,
            frozen_ms: 0,
            pause_origin: None,
            warning_fired: false,
            floor: None,
            ticker: None,
        }
    }

    /// Starts counting down towards `expires_at` (Unix seconds).
    ///
    /// A session that is already past its expiry starts anyway and expires
    /// on the first tick.
    ///
    /// # Errors
    /// [`TimerError::AlreadyStarted`] unless the timer is stopped.
    pub fn start(&mut self, expires_at: u64) -> Result<(), TimerError> {
        if self.status != TimerStatus::Stopped {
            return Err(TimerError::AlreadyStarted(self.status));
        }
        let now = self.clock.now_ms();
        self.status = TimerStatus::Running;
        self.expires_at_ms = Some(Self::expiry_ms(now, expires_at));
        self.started_at_ms = Some(now);
        self.warning_fired = false;
        self.floor = None;
        self.pause_origin = None;
        self.arm_ticker();
        info!(
            expires_at,
            remaining = self.remaining_seconds(),
            "timer started"
        );
        Ok(())
    }

    /// Stops the countdown and forgets the expiry. Idempotent.
    pub fn stop(&mut self) {
        if self.status != TimerStatus::Stopped {
            debug!(status = %self.status, "timer stopped");
        }
        self.status = TimerStatus::Stopped;
        self.expires_at_ms = None;
        self.pause_origin = None;
        self.ticker = None;
    }

    /// Recomputes the remaining time and reports what happened.
    ///
    /// Does nothing unless running.
    pub fn tick(&mut self) -> Vec<TimerEvent> {
        if self.status != TimerStatus::Running {
            return Vec::new();
        }
        let remaining = self.remaining_seconds();
        self.floor = Some(remaining);
        trace!(remaining, "timer tick");

        let mut events = vec![TimerEvent::Tick {
            remaining_seconds: remaining,
        }];

        if remaining > 0
            && !self.warning_fired
            && self.config.warning_threshold_seconds > 0
            && remaining <= self.config.warning_threshold_seconds
        {
            self.warning_fired = true;
            info!(remaining, "warning threshold reached");
            events.push(TimerEvent::Warning {
                remaining_seconds: remaining,
            });
        }

        if remaining == 0 {
            self.status = TimerStatus::Expired;
            self.ticker = None;
            info!("timer expired");
            events.push(TimerEvent::Expired);
        }
        events
    }

    /// Waits for the next tick and runs it.
    ///
    /// Pends forever while the timer isn't running. Cancel safe: dropping
    /// the future before it resolves loses no tick.
    pub async fn wait_for_tick(&mut self) -> Vec<TimerEvent> {
        match self.ticker.as_mut() {
            Some(ticker) if self.status == TimerStatus::Running => {
                ticker.tick().await;
            }
            _ => std::future::pending::<()>().await,
        }
        self.tick()
    }

    /// Pauses on request of the user or host.
    ///
    /// Pausing a timer that is already paused by visibility takes the
    /// pause over, so becoming visible will no longer resume it.
    ///
    /// # Errors
    /// [`TimerError::NotRunning`] if there is nothing to pause.
    pub fn pause(&mut self) -> Result<(), TimerError> {
        match self.status {
            TimerStatus::Running => {
                self.freeze(PauseOrigin::Explicit);
                Ok(())
            }
            TimerStatus::Paused => {
                self.pause_origin = Some(PauseOrigin::Explicit);
                Ok(())
            }
            other => Err(TimerError::NotRunning(other)),
        }
    }

    /// Resumes from any pause. Remaining time continues from where it
    /// froze.
    ///
    /// # Errors
    /// [`TimerError::NotPaused`] if the timer isn't paused.
    pub fn resume(&mut self) -> Result<(), TimerError> {
        if self.status != TimerStatus::Paused {
            return Err(TimerError::NotPaused(self.status));
        }
        let now = self.clock.now_ms();
        self.expires_at_ms = Some(now.saturating_add(self.frozen_ms));
        self.status = TimerStatus::Running;
        self.pause_origin = None;
        self.arm_ticker();
        info!(remaining = self.remaining_seconds(), "timer resumed");
        Ok(())
    }

    /// Applies a page visibility change.
    ///
    /// With `pause_on_hidden`, hiding the page pauses a running timer and
    /// showing it resumes the timer only if that pause was automatic.
    /// Returns `true` if the status changed.
    pub fn on_visibility(&mut self, visibility: Visibility) -> bool {
        if !self.config.pause_on_hidden {
            return false;
        }
        match (visibility, self.status, self.pause_origin) {
            (Visibility::Hidden, TimerStatus::Running, _) => {
                self.freeze(PauseOrigin::Visibility);
                true
            }
            (Visibility::Visible, TimerStatus::Paused, Some(PauseOrigin::Visibility)) => {
                self.resume().is_ok()
            }
            _ => false,
        }
    }

    /// Moves the countdown to the server's view of the remaining time.
    ///
    /// Differences within the skew tolerance are ignored. Corrections may
    /// raise the remaining time. An expired or stopped timer is left alone.
    pub fn reconcile(&mut self, server_remaining: u64) -> Option<Reconciliation> {
        let previous = match self.status {
            TimerStatus::Running | TimerStatus::Paused => self.remaining_seconds(),
            TimerStatus::Stopped | TimerStatus::Expired => return None,
        };
        if server_remaining > Self::MAX_REMAINING_SECONDS {
            warn!(server_remaining, "implausible remaining time, clamping");
        }
        let server_remaining = server_remaining.min(Self::MAX_REMAINING_SECONDS);
        if previous.abs_diff(server_remaining) <= self.config.clock_skew_tolerance_seconds {
            return None;
        }
        let now = self.clock.now_ms();
        self.set_remaining_ms(now, server_remaining * 1000);
        debug!(previous, applied = server_remaining, "timer reconciled");
        Some(Reconciliation {
            previous,
            applied: server_remaining,
        })
    }

    /// Moves the countdown to a new absolute expiry (Unix seconds), as
    /// after an extension. Subject to the same tolerance as
    /// [`reconcile`](Self::reconcile).
    pub fn reconcile_expiry(&mut self, expires_at: u64) -> Option<Reconciliation> {
        let previous = match self.status {
            TimerStatus::Running | TimerStatus::Paused => self.remaining_seconds(),
            TimerStatus::Stopped | TimerStatus::Expired => return None,
        };
        let now = self.clock.now_ms();
        let target_ms = Self::expiry_ms(now, expires_at).saturating_sub(now);
        let applied = target_ms.div_ceil(1000);
        if previous.abs_diff(applied) <= self.config.clock_skew_tolerance_seconds {
            return None;
        }
        self.set_remaining_ms(now, target_ms);
        debug!(previous, applied, expires_at, "timer moved to new expiry");
        Some(Reconciliation { previous, applied })
    }

    /// Re-enables the warning after an extension, if the remaining time is
    /// back above the threshold by more than the skew tolerance. Returns
    /// `true` if re-armed.
    ///
    /// Only extensions should call this. A server correction that lands a
    /// few seconds above the threshold must not make the warning fire twice.
    pub fn rearm_warning(&mut self) -> bool {
        let margin = self
            .config
            .warning_threshold_seconds
            .saturating_add(self.config.clock_skew_tolerance_seconds);
        if self.warning_fired && self.remaining_seconds() > margin {
            self.warning_fired = false;
            debug!("warning re-armed");
            true
        } else {
            false
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Seconds left, rounded up. Never negative, and never higher than the
    /// last reported value unless a correction was applied in between.
    pub fn remaining_seconds(&self) -> u64 {
        match self.status {
            TimerStatus::Stopped | TimerStatus::Expired => 0,
            TimerStatus::Paused => self.frozen_ms.div_ceil(1000),
            TimerStatus::Running => {
                let computed = self.remaining_ms(self.clock.now_ms()).div_ceil(1000);
                self.floor.map_or(computed, |floor| computed.min(floor))
            }
        }
    }

    pub fn status(&self) -> TimerStatus {
        self.status
    }

    pub fn pause_origin(&self) -> Option<PauseOrigin> {
        self.pause_origin
    }

    pub fn warning_fired(&self) -> bool {
        self.warning_fired
    }

    /// When [`start`](Self::start) was called, Unix milliseconds.
    pub fn started_at_ms(&self) -> Option<u64> {
        self.started_at_ms
    }

    /// The effective expiry in Unix seconds, if counting (or paused).
    pub fn expires_at(&self) -> Option<u64> {
        match self.status {
            TimerStatus::Running => self.expires_at_ms.map(|ms| ms / 1000),
            TimerStatus::Paused => Some(self.clock.now_ms().saturating_add(self.frozen_ms) / 1000),
            TimerStatus::Stopped | TimerStatus::Expired => None,
        }
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    // -- internals ----------------------------------------------------------

    /// `expires_at` (Unix seconds) in milliseconds, no further than
    /// [`Self::MAX_REMAINING_SECONDS`] past `now_ms`.
    fn expiry_ms(now_ms: u64, expires_at: u64) -> u64 {
        let ceiling = now_ms.saturating_add(Self::MAX_REMAINING_SECONDS * 1000);
        expires_at.saturating_mul(1000).min(ceiling)
    }

    fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms
            .map_or(0, |expires| expires.saturating_sub(now_ms))
    }

    fn freeze(&mut self, origin: PauseOrigin) {
        let now = self.clock.now_ms();
        let floor_ms = self.floor.map_or(u64::MAX, |s| s.saturating_mul(1000));
        self.frozen_ms = self.remaining_ms(now).min(floor_ms);
        self.status = TimerStatus::Paused;
        self.pause_origin = Some(origin);
        self.ticker = None;
        info!(?origin, remaining = self.remaining_seconds(), "timer paused");
    }

    fn set_remaining_ms(&mut self, now_ms: u64, remaining_ms: u64) {
        match self.status {
            TimerStatus::Running => self.expires_at_ms = Some(now_ms.saturating_add(remaining_ms)),
            TimerStatus::Paused => self.frozen_ms = remaining_ms,
            TimerStatus::Stopped | TimerStatus::Expired => {}
        }
        self.floor = None;
    }

    fn arm_ticker(&mut self) {
        let mut ticker = time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }
}

// ---------------------------------------------------------------------------
// Display helper
// ---------------------------------------------------------------------------

/// Renders seconds as `MM:SS`, or `H:MM:SS` from one hour up.
pub fn format_remaining(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use gwsession_platform::TokioClock;

    use super::*;

    const T0: u64 = 1_700_000_000;

    fn engine(config: TimerConfig) -> TimerEngine {
        TimerEngine::new(config, Arc::new(TokioClock::new(T0 * 1000)))
    }

    #[test]
    fn test_format_remaining_minutes_and_hours() {
        assert_eq!(format_remaining(0), "00:00");
        assert_eq!(format_remaining(59), "00:59");
        assert_eq!(format_remaining(300), "05:00");
        assert_eq!(format_remaining(3599), "59:59");
        assert_eq!(format_remaining(3600), "1:00:00");
        assert_eq!(format_remaining(7325), "2:02:05");
    }

    #[test]
    fn test_validated_fixes_zero_interval_and_large_tolerance() {
        let cfg = TimerConfig {
            tick_interval: Duration::ZERO,
            clock_skew_tolerance_seconds: 600,
            ..TimerConfig::default()
        }
        .validated();
        assert_eq!(cfg.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.clock_skew_tolerance_seconds, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_reports_zero_and_no_events() {
        let mut t = engine(TimerConfig::default());
        assert_eq!(t.remaining_seconds(), 0);
        assert!(t.tick().is_empty());
        assert_eq!(t.expires_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_error() {
        let mut t = engine(TimerConfig::default());
        t.start(T0 + 60).unwrap();
        assert_eq!(
            t.start(T0 + 60),
            Err(TimerError::AlreadyStarted(TimerStatus::Running))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_rounds_up_partial_seconds() {
        let mut t = engine(TimerConfig::default());
        t.start(T0 + 10).unwrap();

        time::advance(Duration::from_millis(9_001)).await;

        assert_eq!(t.remaining_seconds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_huge_remaining_is_clamped() {
        let mut t = engine(TimerConfig::default());
        t.start(T0 + 600).unwrap();

        let applied = t.reconcile(u64::MAX).unwrap();

        assert_eq!(applied.applied, TimerEngine::MAX_REMAINING_SECONDS);
        assert_eq!(t.remaining_seconds(), TimerEngine::MAX_REMAINING_SECONDS);
        assert_eq!(remaining_of_tick(&mut t), TimerEngine::MAX_REMAINING_SECONDS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_at_far_future_expiry_is_clamped() {
        let mut t = engine(TimerConfig::default());

        t.start(u64::MAX).unwrap();

        assert_eq!(t.remaining_seconds(), TimerEngine::MAX_REMAINING_SECONDS);
        assert!(t.reconcile_expiry(u64::MAX).is_none());
        t.pause().unwrap();
        t.resume().unwrap();
        assert_eq!(t.remaining_seconds(), TimerEngine::MAX_REMAINING_SECONDS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_huge_remaining_while_paused_is_clamped() {
        let mut t = engine(TimerConfig::default());
        t.start(T0 + 600).unwrap();
        t.pause().unwrap();

        t.reconcile(u64::MAX).unwrap();
        t.resume().unwrap();

        assert_eq!(t.remaining_seconds(), TimerEngine::MAX_REMAINING_SECONDS);
        assert!(t.expires_at().is_some());
    }

    fn remaining_of_tick(t: &mut TimerEngine) -> u64 {
        t.tick()
            .iter()
            .find_map(|e| match e {
                TimerEvent::Tick { remaining_seconds } => Some(*remaining_seconds),
                _ => None,
            })
            .unwrap_or_default()
    }
}
