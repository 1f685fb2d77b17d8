//! In-process simulation of the marketplace session API.
//!
//! Holds sessions in a map and answers the five calls with the same
//! semantics as the real backend: remaining time is computed from the
//! shared clock, renewals push the expiry out, completion refunds unused
//! minutes. Failure injection (`set_offline`, `fail_next`, `set_latency`)
//! lets tests exercise the engine's degraded paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gwsession_platform::Clock;
use gwsession_protocol::{
    BackendSession, CompleteResponse, HeartbeatResponse, Jwks, RenewResponse, SessionId,
    SessionStatus, ValidateResponse,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::{BackendError, SessionBackend};

/// Simulated price per session minute, in marketplace tokens.
const TOKENS_PER_MINUTE: f64 = 1.0;

/// A call the simulated backend received, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    FetchJwks,
    Validate,
    Heartbeat(SessionId),
    Renew(SessionId, u64),
    Complete(SessionId, Option<u64>),
}

#[derive(Debug, Clone)]
struct SimSession {
    token: String,
    app_id: String,
    user_id: String,
    org_id: String,
    started_at: u64,
    expires_at: u64,
    status: SessionStatus,
    tokens_spent: f64,
}

#[derive(Default)]
struct SimState {
    sessions: HashMap<String, SimSession>,
    jwks: Jwks,
    offline: bool,
    fail_next: u32,
    latency: Duration,
    calls: Vec<BackendCall>,
}

/// The session API, simulated in memory.
pub struct InMemoryBackend {
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Sets the key set served from the JWKS endpoint.
    pub fn set_jwks(&self, jwks: Jwks) {
        self.state.lock().jwks = jwks;
    }

    /// Registers a session the backend will recognize.
    pub fn insert_session(
        &self,
        session_id: &str,
        token: &str,
        app_id: &str,
        user_id: &str,
        org_id: &str,
        expires_at: u64,
    ) {
        let now = self.clock.now_secs();
        let minutes = expires_at.saturating_sub(now) as f64 / 60.0;
        self.state.lock().sessions.insert(
            session_id.to_string(),
            SimSession {
                token: token.to_string(),
                app_id: app_id.to_string(),
                user_id: user_id.to_string(),
                org_id: org_id.to_string(),
                started_at: now,
                expires_at,
                status: SessionStatus::Active,
                tokens_spent: minutes * TOKENS_PER_MINUTE,
            },
        );
    }

    /// While offline, every call fails with [`BackendError::Network`].
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Makes the next `n` calls fail with a 503.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Delays every answer by `latency` (Tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Marks a session revoked server-side.
    pub fn revoke(&self, session_id: &str) {
        if let Some(s) = self.state.lock().sessions.get_mut(session_id) {
            s.status = SessionStatus::Revoked;
        }
    }

    /// Moves a session's server-side expiry, as an out-of-band extension
    /// or admin adjustment would.
    pub fn set_expires_at(&self, session_id: &str, expires_at: u64) {
        if let Some(s) = self.state.lock().sessions.get_mut(session_id) {
            s.expires_at = expires_at;
        }
    }

    /// Server-side expiry of a session.
    pub fn expires_at(&self, session_id: &str) -> Option<u64> {
        self.state.lock().sessions.get(session_id).map(|s| s.expires_at)
    }

    /// Server-side status of a session.
    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.state.lock().sessions.get(session_id).map(|s| s.status)
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Number of heartbeats received for `session_id`.
    pub fn heartbeat_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Heartbeat(id) if id.as_str() == session_id))
            .count()
    }

    /// Number of JWKS fetches received.
    pub fn jwks_fetch_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, BackendCall::FetchJwks))
            .count()
    }

    /// Records the call, applies latency and injected failures.
    async fn enter(&self, call: BackendCall) -> Result<(), BackendError> {
        let latency = {
            let mut state = self.state.lock();
            debug!(?call, "simulated backend call");
            state.calls.push(call);
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        if state.offline {
            return Err(BackendError::Network("backend unreachable".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BackendError::Rejected {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        Ok(())
    }

    /// Looks up a session and checks the bearer token.
    fn authorize<'a>(
        sessions: &'a mut HashMap<String, SimSession>,
        session_id: &SessionId,
        token: &str,
    ) -> Result<&'a mut SimSession, BackendError> {
        let session = sessions
            .get_mut(session_id.as_str())
            .ok_or_else(|| BackendError::Rejected {
                status: 404,
                message: format!("session {session_id} not found"),
            })?;
        if session.token != token {
            return Err(BackendError::Rejected {
                status: 401,
                message: "token does not match session".into(),
            });
        }
        Ok(session)
    }

    /// Flips an active session to expired once its time is up.
    fn refresh_status(session: &mut SimSession, now: u64) {
        if session.status == SessionStatus::Active && now >= session.expires_at {
            session.status = SessionStatus::Expired;
        }
    }
}

impl SessionBackend for InMemoryBackend {
    async fn fetch_jwks(&self, _jwks_uri: &str) -> Result<Jwks, BackendError> {
        self.enter(BackendCall::FetchJwks).await?;
        Ok(self.state.lock().jwks.clone())
    }

    async fn validate(&self, token: &str) -> Result<ValidateResponse, BackendError> {
        self.enter(BackendCall::Validate).await?;
        let now = self.clock.now_secs();
        let mut state = self.state.lock();
        let Some((id, session)) = state
            .sessions
            .iter_mut()
            .find(|(_, s)| s.token == token)
        else {
            return Err(BackendError::Rejected {
                status: 401,
                message: "unknown session token".into(),
            });
        };
        Self::refresh_status(session, now);
        if session.status != SessionStatus::Active {
            return Ok(ValidateResponse {
                valid: false,
                session: None,
                remaining_seconds: Some(0),
                error: Some(format!("session is {}", session.status)),
            });
        }
        let remaining = session.expires_at.saturating_sub(now);
        Ok(ValidateResponse {
            valid: true,
            session: Some(BackendSession {
                session_id: id.clone(),
                app_id: Some(session.app_id.clone()),
                user_id: Some(session.user_id.clone()),
                org_id: Some(session.org_id.clone()),
                expires_at: Some(session.expires_at),
                duration_minutes: Some(session.expires_at.saturating_sub(session.started_at) / 60),
                status: Some(session.status),
            }),
            remaining_seconds: Some(remaining),
            error: None,
        })
    }

    async fn heartbeat(
        &self,
        session_id: &SessionId,
        token: &str,
        _timestamp: Option<u64>,
    ) -> Result<HeartbeatResponse, BackendError> {
        self.enter(BackendCall::Heartbeat(session_id.clone())).await?;
        let now = self.clock.now_secs();
        let mut state = self.state.lock();
        let session = Self::authorize(&mut state.sessions, session_id, token)?;
        Self::refresh_status(session, now);
        let remaining = if session.status == SessionStatus::Active {
            session.expires_at.saturating_sub(now)
        } else {
            0
        };
        Ok(HeartbeatResponse {
            acknowledged: true,
            remaining_seconds: remaining,
            status: session.status,
        })
    }

    async fn renew(
        &self,
        session_id: &SessionId,
        token: &str,
        additional_minutes: u64,
    ) -> Result<RenewResponse, BackendError> {
        self.enter(BackendCall::Renew(session_id.clone(), additional_minutes))
            .await?;
        let now = self.clock.now_secs();
        let mut state = self.state.lock();
        let session = Self::authorize(&mut state.sessions, session_id, token)?;
        Self::refresh_status(session, now);
        if session.status != SessionStatus::Active {
            return Err(BackendError::Rejected {
                status: 409,
                message: format!("cannot renew a session that is {}", session.status),
            });
        }
        if additional_minutes == 0 {
            return Err(BackendError::Rejected {
                status: 400,
                message: "additional_minutes must be positive".into(),
            });
        }
        let cost = additional_minutes as f64 * TOKENS_PER_MINUTE;
        session.expires_at += additional_minutes * 60;
        session.tokens_spent += cost;
        Ok(RenewResponse {
            session_id: session_id.to_string(),
            new_expires_at: session.expires_at,
            additional_cost: cost,
            total_tokens_spent: session.tokens_spent,
        })
    }

    async fn complete(
        &self,
        session_id: &SessionId,
        token: &str,
        actual_usage_minutes: Option<u64>,
    ) -> Result<CompleteResponse, BackendError> {
        self.enter(BackendCall::Complete(session_id.clone(), actual_usage_minutes))
            .await?;
        let now = self.clock.now_secs();
        let mut state = self.state.lock();
        let session = Self::authorize(&mut state.sessions, session_id, token)?;
        if matches!(
            session.status,
            SessionStatus::Completed | SessionStatus::Revoked
        ) {
            return Err(BackendError::Rejected {
                status: 409,
                message: format!("session is already {}", session.status),
            });
        }
        let used_minutes = actual_usage_minutes
            .unwrap_or(now.saturating_sub(session.started_at) / 60) as f64;
        let final_cost = (used_minutes * TOKENS_PER_MINUTE).min(session.tokens_spent);
        let refund = session.tokens_spent - final_cost;
        session.status = SessionStatus::Completed;
        session.expires_at = session.expires_at.min(now);
        Ok(CompleteResponse {
            session_id: session_id.to_string(),
            tokens_refunded: refund,
            final_cost,
        })
    }
}
