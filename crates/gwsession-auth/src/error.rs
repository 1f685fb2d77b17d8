//! Error types for token validation.

use gwsession_backend::BackendError;

/// Why a session token was not accepted.
///
/// Every variant is terminal for the token: retrying with the same token
/// and the same key material gives the same answer. The one exception is
/// [`AuthError::Network`], which says nothing about the token itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The token is not a three-segment JWT with JSON header and claims.
    /// Detected before any network call.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The signature did not verify against the selected key, or the token
    /// uses an algorithm other than RS256.
    #[error("invalid token signature: {0}")]
    SignatureInvalid(String),

    /// `exp` is not in the future. Checked before the signature, so a
    /// forged-but-expired token is still reported as expired.
    #[error("token expired at {expired_at} (now {now})")]
    Expired { expired_at: u64, now: u64 },

    /// No signing key with the token's `kid`, even after refreshing the
    /// key set once.
    #[error("no signing key found for kid {kid:?}")]
    KeyNotFound { kid: Option<String> },

    /// The `iss` claim doesn't match the configured issuer.
    #[error("issuer mismatch: expected {expected:?}, got {actual:?}")]
    IssuerMismatch { expected: String, actual: String },

    /// The key set or the validation endpoint could not be reached.
    #[error("network error during validation: {0}")]
    Network(#[source] BackendError),

    /// The backend looked at the token and said no.
    #[error("backend rejected token: {0}")]
    BackendRejected(String),
}
