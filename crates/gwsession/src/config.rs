//! Session configuration.
//!
//! [`SessionConfig`] is the one object an embedding application fills in.
//! It deserializes from the same camelCase JSON the host page would carry,
//! and hands out the per-component configs the engine is built from.

use std::time::Duration;

use gwsession_auth::ValidatorConfig;
use gwsession_heartbeat::HeartbeatConfig;
use gwsession_tabs::TabConfig;
use gwsession_timer::TimerConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::SessionError;

/// Everything that shapes one session's lifecycle.
///
/// Lifecycle hooks are code, not data, so they are passed separately with
/// [`SessionBuilder::hooks`](crate::SessionBuilder::hooks).
///
/// ```rust
/// use gwsession::SessionConfig;
///
/// let config = SessionConfig::from_json(r#"{
///     "apiEndpoint": "https://api.example.com",
///     "warningThresholdSeconds": 120,
///     "enableTabSync": false
/// }"#).unwrap();
///
/// assert_eq!(config.warning_threshold_seconds, 120);
/// assert_eq!(config.jwt_param_name, "gwSession");
/// assert_eq!(config.jwks_uri(), "https://api.example.com/.well-known/jwks.json");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Where the signing keys are published. Defaults to
    /// `{api_endpoint}/.well-known/jwks.json`.
    pub jwks_uri: Option<String>,

    /// URL query parameter that carries the session token.
    ///
    /// Default: `"gwSession"`.
    pub jwt_param_name: String,

    /// Base URL of the session API.
    pub api_endpoint: String,

    /// Required `iss` claim. `None` accepts any issuer.
    pub jwt_issuer: Option<String>,

    /// Start the countdown as soon as the session is validated.
    ///
    /// Default: `true`.
    pub auto_start: bool,

    /// Default: 300.
    pub warning_threshold_seconds: u64,

    /// Default: `true`.
    pub enable_heartbeat: bool,

    /// Heartbeat period. Also the lease renewal and `TIME_SYNC` period.
    ///
    /// Default: 30.
    pub heartbeat_interval_seconds: u64,

    /// Coordinate with other tabs of the same session.
    ///
    /// Default: `true`.
    pub enable_tab_sync: bool,

    /// Pause the countdown while the page is hidden.
    ///
    /// Default: `false`.
    pub pause_on_hidden: bool,

    /// Ask the backend to validate the token instead of checking its
    /// signature locally.
    ///
    /// Default: `false`.
    pub use_backend_validation: bool,

    /// Upper bound for each lifecycle hook.
    ///
    /// Default: 5000.
    pub hook_timeout_ms: u64,

    /// Where the user is sent once the session is over or failed. No
    /// redirect is signalled when unset.
    pub marketplace_url: Option<String>,

    /// Per-request timeout of the HTTP backend.
    ///
    /// Default: 10000.
    pub request_timeout_ms: u64,

    /// Default: 300.
    pub jwks_cache_ttl_seconds: u64,

    /// Consecutive heartbeat failures before retries stop backing off.
    ///
    /// Default: 5.
    pub max_heartbeat_failures: u32,

    /// Server corrections smaller than this are ignored.
    ///
    /// Default: 2.
    pub clock_skew_tolerance_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            jwks_uri: None,
            jwt_param_name: "gwSession".to_string(),
            api_endpoint: String::new(),
            jwt_issuer: None,
            auto_start: true,
            warning_threshold_seconds: 300,
            enable_heartbeat: true,
            heartbeat_interval_seconds: 30,
            enable_tab_sync: true,
            pause_on_hidden: false,
            use_backend_validation: false,
            hook_timeout_ms: 5000,
            marketplace_url: None,
            request_timeout_ms: 10_000,
            jwks_cache_ttl_seconds: 300,
            max_heartbeat_failures: 5,
            clock_skew_tolerance_seconds: 2,
        }
    }
}

impl SessionConfig {
    /// Parses a camelCase JSON config and clamps it with
    /// [`validated`](Self::validated). Unknown keys (such as `hooks`) are
    /// ignored.
    ///
    /// # Errors
    /// [`SessionError::Config`] if the JSON doesn't parse.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        Ok(config.validated())
    }

    /// Clamps out-of-range values, logging each correction.
    pub fn validated(mut self) -> Self {
        if self.jwt_param_name.trim().is_empty() {
            warn!("jwt_param_name is empty, using \"gwSession\"");
            self.jwt_param_name = "gwSession".to_string();
        }
        if self.heartbeat_interval_seconds == 0 {
            warn!("heartbeat_interval_seconds is 0, using 1");
            self.heartbeat_interval_seconds = 1;
        }
        if self.hook_timeout_ms == 0 {
            warn!("hook_timeout_ms is 0, using 5000");
            self.hook_timeout_ms = 5000;
        }
        if self.request_timeout_ms == 0 {
            warn!("request_timeout_ms is 0, using 10000");
            self.request_timeout_ms = 10_000;
        }
        if self.max_heartbeat_failures == 0 {
            warn!("max_heartbeat_failures is 0, using 1");
            self.max_heartbeat_failures = 1;
        }
        if self.clock_skew_tolerance_seconds > TimerConfig::MAX_SKEW_TOLERANCE_SECONDS {
            warn!(
                tolerance = self.clock_skew_tolerance_seconds,
                "clock skew tolerance too large, clamping"
            );
            self.clock_skew_tolerance_seconds = TimerConfig::MAX_SKEW_TOLERANCE_SECONDS;
        }
        self
    }

    /// Rejects configs the engine cannot run with.
    ///
    /// # Errors
    /// [`SessionError::Config`] if `api_endpoint` (or `marketplace_url`,
    /// when set) is not an absolute URL.
    pub fn check(&self) -> Result<(), SessionError> {
        Url::parse(&self.api_endpoint).map_err(|e| {
            SessionError::Config(format!("api_endpoint {:?}: {e}", self.api_endpoint))
        })?;
        if let Some(url) = &self.marketplace_url {
            Url::parse(url)
                .map_err(|e| SessionError::Config(format!("marketplace_url {url:?}: {e}")))?;
        }
        Ok(())
    }

    /// The configured JWKS location, or the well-known path under
    /// `api_endpoint`.
    pub fn jwks_uri(&self) -> String {
        match &self.jwks_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "{}/.well-known/jwks.json",
                self.api_endpoint.trim_end_matches('/')
            ),
        }
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    // -- per-component configs ---------------------------------------------

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            jwks_uri: self.jwks_uri(),
            issuer: self.jwt_issuer.clone(),
            use_backend_validation: self.use_backend_validation,
            jwks_cache_ttl: Duration::from_secs(self.jwks_cache_ttl_seconds),
        }
    }

    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig {
            warning_threshold_seconds: self.warning_threshold_seconds,
            pause_on_hidden: self.pause_on_hidden,
            clock_skew_tolerance_seconds: self.clock_skew_tolerance_seconds,
            ..TimerConfig::default()
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval(),
            max_consecutive_failures: self.max_heartbeat_failures,
            ..HeartbeatConfig::default()
        }
    }

    pub fn tab_config(&self) -> TabConfig {
        TabConfig {
            sync_interval: self.heartbeat_interval(),
            ..TabConfig::default()
        }
    }

    /// An HTTP client for `api_endpoint` with the configured timeout.
    ///
    /// # Errors
    /// [`SessionError::Backend`] if `api_endpoint` is not a usable URL or
    /// the client can't be built.
    #[cfg(feature = "http")]
    pub fn http_backend(&self) -> Result<gwsession_backend::HttpBackend, SessionError> {
        Ok(gwsession_backend::HttpBackend::new(
            &self.api_endpoint,
            self.request_timeout(),
        )?)
    }
}
