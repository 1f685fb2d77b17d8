//! Token validation: expiry, signature (JWKS or backend) and issuer.
//!
//! ```text
//! parse ──→ exp vs clock ──┬─ use_backend_validation ──→ POST /sessions/validate
//!                          └─ otherwise ──→ JWKS (cached) ──→ RS256 verify
//!                                                │
//!                                          issuer check ──→ SessionRecord
//! ```
//!
//! Expiry is checked before anything else so an expired token is always
//! reported as expired, whichever path would have judged its signature.

use std::sync::Arc;
use std::time::Duration;

use gwsession_backend::{BackendError, SessionBackend};
use gwsession_platform::Clock;
use gwsession_protocol::{Jwk, SessionClaims, SessionRecord, ValidateResponse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tracing::{debug, info};

use crate::AuthError;
use crate::jwks::JwksCache;
use crate::token::{ParsedToken, parse};

// ---------------------------------------------------------------------------
// ValidatorConfig
// ---------------------------------------------------------------------------

/// How tokens are validated.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Where the signing key set is published.
    pub jwks_uri: String,

    /// Required `iss` claim. `None` accepts any issuer.
    pub issuer: Option<String>,

    /// Ask the backend instead of verifying the signature locally.
    pub use_backend_validation: bool,

    /// How long a fetched key set is reused.
    ///
    /// Default: 300 seconds.
    pub jwks_cache_ttl: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            jwks_uri: String::new(),
            issuer: None,
            use_backend_validation: false,
            jwks_cache_ttl: Duration::from_secs(300),
        }
    }
}

// ---------------------------------------------------------------------------
// TokenValidator
// ---------------------------------------------------------------------------

/// Turns an inbound session token into a [`SessionRecord`].
///
/// The only state it keeps is the JWKS cache, so validating the same token
/// against the same key material always gives the same result.
pub struct TokenValidator<B> {
    config: ValidatorConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<B>,
    jwks: JwksCache,
}

impl<B: SessionBackend> TokenValidator<B> {
    pub fn new(config: ValidatorConfig, clock: Arc<dyn Clock>, backend: Arc<B>) -> Self {
        let jwks = JwksCache::new(config.jwks_cache_ttl);
        Self {
            config,
            clock,
            backend,
            jwks,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validates `token` and builds the session record.
    ///
    /// # Errors
    /// - [`AuthError::Malformed`] — not a parsable JWT (no network call made)
    /// - [`AuthError::Expired`] — `exp` is not in the future
    /// - [`AuthError::KeyNotFound`] / [`AuthError::SignatureInvalid`] — local
    ///   RS256 verification failed
    /// - [`AuthError::BackendRejected`] / [`AuthError::Network`] — backend
    ///   validation said no, or couldn't be reached
    /// - [`AuthError::IssuerMismatch`] — `iss` isn't the configured issuer
    pub async fn validate(&self, token: &str) -> Result<SessionRecord, AuthError> {
        let parsed = parse(token)?;

        let now = self.clock.now_secs();
        if parsed.claims.exp <= now {
            return Err(AuthError::Expired {
                expired_at: parsed.claims.exp,
                now,
            });
        }

        let mut record = SessionRecord::from_claims(&parsed.claims)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        if self.config.use_backend_validation {
            let response = self.ask_backend(token).await?;
            self.apply_backend_view(&mut record, &response)?;
        } else {
            self.verify_signature(&parsed).await?;
        }

        self.check_issuer(&parsed.claims)?;

        info!(
            session_id = %record.session_id,
            expires_at = record.expires_at,
            backend = self.config.use_backend_validation,
            "session token validated"
        );
        Ok(record)
    }

    // -- backend path -------------------------------------------------------

    async fn ask_backend(&self, token: &str) -> Result<ValidateResponse, AuthError> {
        let response = self.backend.validate(token).await.map_err(|e| match e {
            BackendError::Rejected { .. } if !e.is_transient() => {
                AuthError::BackendRejected(e.to_string())
            }
            other => AuthError::Network(other),
        })?;
        if !response.valid {
            let reason = response
                .error
                .clone()
                .unwrap_or_else(|| "session is not valid".to_string());
            return Err(AuthError::BackendRejected(reason));
        }
        Ok(response)
    }

    /// The backend's remaining time wins over the token's `exp`.
    fn apply_backend_view(
        &self,
        record: &mut SessionRecord,
        response: &ValidateResponse,
    ) -> Result<(), AuthError> {
        let now = self.clock.now_secs();
        let server_expiry = match response.remaining_seconds {
            Some(remaining) => Some(now.saturating_add(remaining)),
            None => response.session.as_ref().and_then(|s| s.expires_at),
        };
        if let Some(expires_at) = server_expiry {
            if expires_at <= now {
                return Err(AuthError::Expired {
                    expired_at: expires_at,
                    now,
                });
            }
            if record.extend_to(expires_at) {
                debug!(
                    session_id = %record.session_id,
                    expires_at, "expiry taken from backend"
                );
            }
        }
        Ok(())
    }

    // -- JWKS path ----------------------------------------------------------

    async fn verify_signature(&self, parsed: &ParsedToken) -> Result<(), AuthError> {
        if parsed.header.alg != "RS256" {
            return Err(AuthError::SignatureInvalid(format!(
                "unsupported algorithm {:?}",
                parsed.header.alg
            )));
        }

        let jwk = self.find_key(parsed.header.kid.as_deref()).await?;
        let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
            return Err(AuthError::SignatureInvalid(
                "signing key has no RSA components".into(),
            ));
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| AuthError::SignatureInvalid(format!("unusable signing key: {e}")))?;

        match jsonwebtoken::crypto::verify(
            parsed.signature(),
            parsed.signing_input().as_bytes(),
            &key,
            Algorithm::RS256,
        ) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::SignatureInvalid(
                "signature does not match".into(),
            )),
            Err(e) => Err(AuthError::SignatureInvalid(e.to_string())),
        }
    }

    /// Looks the key up in the cached set; on a miss, refetches once.
    async fn find_key(&self, kid: Option<&str>) -> Result<Jwk, AuthError> {
        let now_ms = self.clock.now_ms();
        if let Some(jwks) = self.jwks.get(now_ms) {
            if let Some(key) = jwks.find(kid) {
                return Ok(key.clone());
            }
            debug!(?kid, "kid not in cached key set, refreshing");
        }

        let jwks = self
            .backend
            .fetch_jwks(&self.config.jwks_uri)
            .await
            .map_err(AuthError::Network)?;
        debug!(keys = jwks.keys.len(), uri = %self.config.jwks_uri, "fetched key set");
        let key = jwks.find(kid).cloned();
        self.jwks.store(jwks, now_ms);

        key.ok_or_else(|| AuthError::KeyNotFound {
            kid: kid.map(str::to_string),
        })
    }

    // -- claims -------------------------------------------------------------

    fn check_issuer(&self, claims: &SessionClaims) -> Result<(), AuthError> {
        match &self.config.issuer {
            Some(expected) if *expected != claims.iss => Err(AuthError::IssuerMismatch {
                expected: expected.clone(),
                actual: claims.iss.clone(),
            }),
            _ => Ok(()),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
