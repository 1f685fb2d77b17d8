//! Client side of the marketplace session API.
//!
//! The engine talks to the backend only through the [`SessionBackend`]
//! trait, the same way the rest of the stack talks to the browser only
//! through `gwsession-platform`. Two implementations ship here:
//!
//! - [`HttpBackend`] (feature `http`) — `reqwest` against the real API,
//!   with a per-request timeout.
//! - [`InMemoryBackend`] (feature `memory`) — an in-process simulation of
//!   the API for tests and demos, with failure injection.

mod error;
#[cfg(feature = "http")]
mod http;
#[cfg(feature = "memory")]
mod memory;

pub use error::BackendError;
#[cfg(feature = "http")]
pub use http::HttpBackend;
#[cfg(feature = "memory")]
pub use memory::{BackendCall, InMemoryBackend};

use std::future::Future;

use gwsession_protocol::{
    CompleteResponse, HeartbeatResponse, Jwks, RenewResponse, SessionId, ValidateResponse,
};

/// The session API as the engine consumes it.
///
/// Every method maps to one HTTP call (see `gwsession_protocol::api`).
/// Methods return `Send` futures so calls can run inside spawned tasks
/// (the heartbeat loop) as well as on the caller's task.
///
/// `token` is the session JWT; implementations send it as a bearer
/// credential on every call except the JWKS fetch.
pub trait SessionBackend: Send + Sync + 'static {
    /// `GET {jwks_uri}`.
    fn fetch_jwks(&self, jwks_uri: &str)
    -> impl Future<Output = Result<Jwks, BackendError>> + Send;

    /// `POST /sessions/validate`.
    fn validate(&self, token: &str)
    -> impl Future<Output = Result<ValidateResponse, BackendError>> + Send;

    /// `POST /sessions/{id}/heartbeat`. `timestamp` is the client clock in
    /// Unix milliseconds.
    fn heartbeat(
        &self,
        session_id: &SessionId,
        token: &str,
        timestamp: Option<u64>,
    ) -> impl Future<Output = Result<HeartbeatResponse, BackendError>> + Send;

    /// `PUT /sessions/{id}/renew`.
    fn renew(
        &self,
        session_id: &SessionId,
        token: &str,
        additional_minutes: u64,
    ) -> impl Future<Output = Result<RenewResponse, BackendError>> + Send;

    /// `POST /sessions/{id}/complete`.
    fn complete(
        &self,
        session_id: &SessionId,
        token: &str,
        actual_usage_minutes: Option<u64>,
    ) -> impl Future<Output = Result<CompleteResponse, BackendError>> + Send;
}
