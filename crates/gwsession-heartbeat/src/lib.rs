//! Backend liveness heartbeat for gwsession.
//!
//! Only the leader tab runs a heartbeat. Every interval it tells the
//! backend the session is still in use, and the backend answers with its
//! own view of the remaining time. The orchestrator feeds that answer into
//! every tab's timer.
//!
//! The agent runs in its own Tokio task ([`spawn_heartbeat`]) and reports
//! through a channel, so a slow or hung request never delays a timer tick.
//! Failures back off exponentially and are only logged: an offline laptop
//! keeps its countdown.
//!
//! ```text
//! beat ──ok──→ Acknowledged ──→ sleep(interval) ──→ beat
//!   │
//!   ├─error──→ Failed ──→ sleep(min(base·2^(n-1), interval)) ──→ beat
//!   │
//!   └─status ≠ active / 401·403·404·410 ──→ Terminated (task ends)
//! ```

use std::sync::Arc;
use std::time::Duration;

use gwsession_backend::{BackendError, SessionBackend};
use gwsession_platform::Clock;
use gwsession_protocol::{HeartbeatResponse, SessionId, SessionStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// HeartbeatConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between successful beats.
    ///
    /// Default: 30 seconds.
    pub interval: Duration,

    /// First retry delay after a failure; doubles per consecutive failure.
    ///
    /// Default: 2 seconds.
    pub retry_base: Duration,

    /// After this many consecutive failures, retries stop backing off and
    /// fall back to the regular interval.
    ///
    /// Default: 5.
    pub max_consecutive_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(2),
            max_consecutive_failures: 5,
        }
    }
}

impl HeartbeatConfig {
    /// Shortest interval accepted.
    pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

    /// Clamps out-of-range values:
    /// - `interval` is at least [`Self::MIN_INTERVAL`].
    /// - `retry_base` is non-zero and not longer than `interval`.
    /// - `max_consecutive_failures` is at least 1.
    pub fn validated(mut self) -> Self {
        if self.interval < Self::MIN_INTERVAL {
            warn!(interval = ?self.interval, "heartbeat interval too short, clamping to 1s");
            self.interval = Self::MIN_INTERVAL;
        }
        if self.retry_base.is_zero() {
            self.retry_base = Self::MIN_INTERVAL;
        }
        self.retry_base = self.retry_base.min(self.interval);
        if self.max_consecutive_failures == 0 {
            warn!("max_consecutive_failures is 0, using 1");
            self.max_consecutive_failures = 1;
        }
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 || failures > self.max_consecutive_failures {
            return self.interval;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.retry_base
            .checked_mul(factor)
            .map_or(self.interval, |d| d.min(self.interval))
    }
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

/// What the agent knows after its last beat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// When the last request was sent, Unix milliseconds.
    pub last_sent_at: Option<u64>,
    pub last_acked_remaining_seconds: Option<u64>,
    pub consecutive_failures: u32,
    pub last_status: Option<SessionStatus>,
}

/// Reported to the orchestrator after every beat.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    /// The backend confirmed the session and reported its remaining time.
    Acknowledged {
        remaining_seconds: u64,
        status: SessionStatus,
    },

    /// The beat failed. The agent retries after `retry_in`.
    Failed {
        consecutive_failures: u32,
        retry_in: Duration,
        reason: String,
    },

    /// The backend says the session is over. The agent has stopped.
    Terminated {
        status: Option<SessionStatus>,
        reason: String,
    },
}

enum Outcome {
    Continue(Duration),
    Stop,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One session's heartbeat against one backend.
pub struct HeartbeatAgent<B> {
    config: HeartbeatConfig,
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    session_id: SessionId,
    token: String,
    state: watch::Sender<HeartbeatState>,
}

impl<B: SessionBackend> HeartbeatAgent<B> {
    pub fn new(
        config: HeartbeatConfig,
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
        session_id: SessionId,
        token: String,
    ) -> Self {
        let (state, _) = watch::channel(HeartbeatState::default());
        Self {
            config: config.validated(),
            backend,
            clock,
            session_id,
            token,
            state,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    /// Sends one heartbeat and classifies the answer.
    pub async fn beat(&self) -> HeartbeatEvent {
        let sent_at = self.clock.now_ms();
        self.state.send_modify(|s| s.last_sent_at = Some(sent_at));

        let result = self
            .backend
            .heartbeat(&self.session_id, &self.token, Some(sent_at))
            .await;

        match result {
            Ok(response) => self.on_response(response),
            Err(err) if err.is_session_rejection() => self.terminated(None, err.to_string()),
            Err(err) => self.failed(describe(&err)),
        }
    }

    fn on_response(&self, response: HeartbeatResponse) -> HeartbeatEvent {
        self.state
            .send_modify(|s| s.last_status = Some(response.status));
        if !response.status.is_live() {
            return self.terminated(
                Some(response.status),
                format!("backend reports session {}", response.status),
            );
        }
        if !response.acknowledged {
            return self.failed("heartbeat not acknowledged".to_string());
        }
        self.state.send_modify(|s| {
            s.last_acked_remaining_seconds = Some(response.remaining_seconds);
            s.consecutive_failures = 0;
        });
        debug!(
            session_id = %self.session_id,
            remaining = response.remaining_seconds,
            "heartbeat acknowledged"
        );
        HeartbeatEvent::Acknowledged {
            remaining_seconds: response.remaining_seconds,
            status: response.status,
        }
    }

    fn failed(&self, reason: String) -> HeartbeatEvent {
        let mut failures = 0;
        self.state.send_modify(|s| {
            s.consecutive_failures += 1;
            failures = s.consecutive_failures;
        });
        let retry_in = self.config.backoff(failures);
        if failures == self.config.max_consecutive_failures {
            warn!(
                session_id = %self.session_id,
                failures,
                "heartbeat keeps failing, falling back to the regular interval"
            );
        } else {
            warn!(
                session_id = %self.session_id,
                failures,
                retry_in = ?retry_in,
                %reason,
                "heartbeat failed"
            );
        }
        HeartbeatEvent::Failed {
            consecutive_failures: failures,
            retry_in,
            reason,
        }
    }

    fn terminated(&self, status: Option<SessionStatus>, reason: String) -> HeartbeatEvent {
        info!(session_id = %self.session_id, %reason, "backend ended the session");
        HeartbeatEvent::Terminated { status, reason }
    }

    fn next_step(&self, event: &HeartbeatEvent) -> Outcome {
        match event {
            HeartbeatEvent::Acknowledged { .. } => Outcome::Continue(self.config.interval),
            HeartbeatEvent::Failed { retry_in, .. } => Outcome::Continue(*retry_in),
            HeartbeatEvent::Terminated { .. } => Outcome::Stop,
        }
    }

    async fn run(self, events: mpsc::Sender<HeartbeatEvent>) {
        info!(
            session_id = %self.session_id,
            interval = ?self.config.interval,
            "heartbeat started"
        );
        loop {
            let event = self.beat().await;
            let step = self.next_step(&event);
            if events.send(event).await.is_err() {
                break;
            }
            match step {
                Outcome::Continue(delay) => tokio::time::sleep(delay).await,
                Outcome::Stop => break,
            }
        }
        debug!(session_id = %self.session_id, "heartbeat loop exited");
    }
}

fn describe(err: &BackendError) -> String {
    match err {
        BackendError::Timeout => "request timed out".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Owns a running heartbeat task. Dropping the handle stops the task.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
    state: watch::Receiver<HeartbeatState>,
}

impl HeartbeatHandle {
    /// The agent's state as of its last beat.
    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    /// Whether the task has exited (terminated, or its receiver is gone).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the task. An in-flight request is abandoned.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts `agent` on its own task. The first beat goes out immediately.
///
/// Events arrive on `events`; the task ends when the backend terminates
/// the session, when `events` is closed, or when the handle is dropped.
pub fn spawn_heartbeat<B: SessionBackend>(
    agent: HeartbeatAgent<B>,
    events: mpsc::Sender<HeartbeatEvent>,
) -> HeartbeatHandle {
    let state = agent.state.subscribe();
    let task = tokio::spawn(agent.run(events));
    HeartbeatHandle { task, state }
}
