//! Unified error type for gwsession.

use std::fmt;
use std::time::Duration;

use gwsession_auth::AuthError;
use gwsession_backend::BackendError;
use gwsession_tabs::CoordinatorError;
use gwsession_timer::TimerError;

use crate::{HookKind, SessionState};

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each wrapped variant lets `?` convert
/// sub-crate errors. [`SessionError::kind`] maps every error onto the
/// public [`ErrorKind`] taxonomy reported to `on_error` observers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The page URL has no token parameter.
    #[error("no session token in URL parameter {0:?}")]
    MissingToken(String),

    /// Token parsing or validation failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A renew/complete call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// A lifecycle hook didn't finish within `hook_timeout_ms`.
    #[error("{hook} hook timed out after {timeout:?}")]
    HookTimeout { hook: HookKind, timeout: Duration },

    /// A lifecycle hook returned an error.
    #[error("{hook} hook failed: {message}")]
    HookFailed { hook: HookKind, message: String },

    /// The operation isn't allowed in the session's current state, e.g.
    /// extending a session that already ended.
    #[error("not allowed while the session is {0}")]
    InvalidState(SessionState),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The failure categories reported to `on_error` observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedToken,
    SignatureInvalid,
    ExpiredToken,
    KeyNotFound,
    Network,
    HookTimeout,
    BackendRejection,
    MissingToken,
    IssuerMismatch,
    HookFailed,
    InvalidState,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingToken(_) => ErrorKind::MissingToken,
            Self::Auth(err) => match err {
                AuthError::Malformed(_) => ErrorKind::MalformedToken,
                AuthError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
                AuthError::Expired { .. } => ErrorKind::ExpiredToken,
                AuthError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
                AuthError::IssuerMismatch { .. } => ErrorKind::IssuerMismatch,
                AuthError::Network(_) => ErrorKind::Network,
                AuthError::BackendRejected(_) => ErrorKind::BackendRejection,
            },
            Self::Backend(err) => match err {
                BackendError::Rejected { .. } if !err.is_transient() => {
                    ErrorKind::BackendRejection
                }
                BackendError::InvalidEndpoint(_) => ErrorKind::Config,
                _ => ErrorKind::Network,
            },
            Self::Coordinator(_) => ErrorKind::Network,
            Self::Timer(_) | Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::HookTimeout { .. } => ErrorKind::HookTimeout,
            Self::HookFailed { .. } => ErrorKind::HookFailed,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_auth_error_keeps_kind() {
        let cases = [
            (AuthError::Malformed("x".into()), ErrorKind::MalformedToken),
            (AuthError::SignatureInvalid("x".into()), ErrorKind::SignatureInvalid),
            (
                AuthError::Expired {
                    expired_at: 1,
                    now: 2,
                },
                ErrorKind::ExpiredToken,
            ),
            (AuthError::KeyNotFound { kid: None }, ErrorKind::KeyNotFound),
            (
                AuthError::Network(BackendError::Timeout),
                ErrorKind::Network,
            ),
            (AuthError::BackendRejected("no".into()), ErrorKind::BackendRejection),
        ];
        for (auth, kind) in cases {
            let err: SessionError = auth.into();
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[test]
    fn test_backend_error_kinds() {
        let rejected: SessionError = BackendError::Rejected {
            status: 409,
            message: "not active".into(),
        }
        .into();
        let unavailable: SessionError = BackendError::Rejected {
            status: 503,
            message: String::new(),
        }
        .into();
        let offline: SessionError = BackendError::Network("reset".into()).into();

        assert_eq!(rejected.kind(), ErrorKind::BackendRejection);
        assert_eq!(unavailable.kind(), ErrorKind::Network);
        assert_eq!(offline.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_hook_timeout_message_names_hook() {
        let err = SessionError::HookTimeout {
            hook: HookKind::SessionStart,
            timeout: Duration::from_millis(100),
        };
        assert_eq!(err.kind(), ErrorKind::HookTimeout);
        assert!(err.to_string().contains("on_session_start"));
    }

    #[test]
    fn test_from_timer_error_is_invalid_state() {
        let err: SessionError =
            TimerError::NotPaused(gwsession_timer::TimerStatus::Running).into();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ExpiredToken.to_string(), "ExpiredToken");
    }
}
