/// Errors returned by a [`SessionBackend`](crate::SessionBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request never got an HTTP answer (DNS, connect, reset, offline).
    #[error("network error: {0}")]
    Network(String),

    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// The backend answered with a non-success status.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body did not match the contract.
    #[error("unexpected response body: {0}")]
    Decode(String),

    /// The configured endpoint is not a usable base URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl BackendError {
    /// Whether retrying later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) | Self::InvalidEndpoint(_) => false,
        }
    }

    /// Whether the backend says the session itself is gone or forbidden
    /// (401, 403, 404, 410).
    pub fn is_session_rejection(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                status: 401 | 403 | 404 | 410,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> BackendError {
        BackendError::Rejected {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Timeout.is_transient());
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(rejected(503).is_transient());
        assert!(rejected(429).is_transient());
        assert!(!rejected(401).is_transient());
        assert!(!BackendError::Decode("x".into()).is_transient());
    }

    #[test]
    fn test_session_rejection_classification() {
        for status in [401, 403, 404, 410] {
            assert!(rejected(status).is_session_rejection(), "{status}");
        }
        assert!(!rejected(500).is_session_rejection());
        assert!(!BackendError::Timeout.is_session_rejection());
    }
}
