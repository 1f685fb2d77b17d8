//! Request and response bodies of the marketplace session API.
//!
//! ```text
//! GET  /.well-known/jwks.json        → Jwks
//! POST /sessions/validate            ValidateRequest  → ValidateResponse
//! POST /sessions/{id}/heartbeat      HeartbeatRequest → HeartbeatResponse
//! PUT  /sessions/{id}/renew          RenewRequest     → RenewResponse
//! POST /sessions/{id}/complete       CompleteRequest  → CompleteResponse
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JWKS
// ---------------------------------------------------------------------------

/// A JSON Web Key Set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Finds the RSA signing key with the given `kid`.
    ///
    /// Keys marked for a use other than `sig` are skipped. With no `kid`,
    /// a set holding exactly one signing key yields that key.
    pub fn find(&self, kid: Option<&str>) -> Option<&Jwk> {
        let mut signing = self.keys.iter().filter(|k| k.is_rsa_signing_key());
        match kid {
            Some(kid) => signing.find(|k| k.kid.as_deref() == Some(kid)),
            None => {
                let first = signing.next();
                if signing.next().is_some() { None } else { first }
            }
        }
    }
}

/// A single JSON Web Key (RSA fields only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwk {
    fn is_rsa_signing_key(&self) -> bool {
        self.kty == "RSA" && self.use_.as_deref().is_none_or(|u| u == "sig")
    }
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Server-side session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Completed,
    Revoked,
    /// Any status this client doesn't know about.
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    /// Whether the server still considers the session usable.
    ///
    /// Unknown statuses are treated as usable; the countdown stays the
    /// fallback authority.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Unknown)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::Revoked => "revoked",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub token: String,
}

/// The backend's view of a session, as returned by `/sessions/validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSession {
    #[serde(alias = "id")]
    pub session_id: String,
    #[serde(default, alias = "application_id", skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, with = "crate::timestamp::option", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(default)]
    pub session: Option<BackendSession>,
    #[serde(default)]
    pub remaining_seconds: Option<u64>,
    /// Human readable reason when `valid` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Client clock, Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    pub remaining_seconds: u64,
    pub status: SessionStatus,
}

// ---------------------------------------------------------------------------
// Renew
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewRequest {
    pub additional_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewResponse {
    pub session_id: String,
    /// New expiry, Unix seconds (RFC 3339 accepted on the wire).
    #[serde(with = "crate::timestamp")]
    pub new_expires_at: u64,
    #[serde(default)]
    pub additional_cost: f64,
    #[serde(default)]
    pub total_tokens_spent: f64,
}

// ---------------------------------------------------------------------------
// Complete
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_usage_minutes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub session_id: String,
    #[serde(default)]
    pub tokens_refunded: f64,
    #[serde(default)]
    pub final_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kid: &str) -> Jwk {
        Jwk {
            kty: "RSA".into(),
            use_: Some("sig".into()),
            kid: Some(kid.into()),
            alg: Some("RS256".into()),
            n: Some("n".into()),
            e: Some("AQAB".into()),
        }
    }

    #[test]
    fn test_jwks_find_by_kid() {
        let jwks = Jwks {
            keys: vec![key("a"), key("b")],
        };
        assert_eq!(jwks.find(Some("b")).unwrap().kid.as_deref(), Some("b"));
        assert!(jwks.find(Some("c")).is_none());
    }

    #[test]
    fn test_jwks_find_without_kid_needs_single_key() {
        let one = Jwks { keys: vec![key("a")] };
        assert!(one.find(None).is_some());

        let two = Jwks {
            keys: vec![key("a"), key("b")],
        };
        assert!(two.find(None).is_none());
    }

    #[test]
    fn test_jwks_find_skips_encryption_and_non_rsa_keys() {
        let mut enc = key("a");
        enc.use_ = Some("enc".into());
        let mut ec = key("b");
        ec.kty = "EC".into();
        let jwks = Jwks { keys: vec![enc, ec] };
        assert!(jwks.find(Some("a")).is_none());
        assert!(jwks.find(Some("b")).is_none());
    }

    #[test]
    fn test_jwk_use_field_renamed() {
        let jwk: Jwk = serde_json::from_str(
            r#"{"kty":"RSA","use":"sig","kid":"k1","alg":"RS256","n":"xx","e":"AQAB"}"#,
        )
        .unwrap();
        assert_eq!(jwk.use_.as_deref(), Some("sig"));
    }

    #[test]
    fn test_unknown_status_deserializes_as_unknown() {
        let resp: HeartbeatResponse = serde_json::from_str(
            r#"{"acknowledged":true,"remaining_seconds":10,"status":"suspended"}"#,
        )
        .unwrap();
        assert_eq!(resp.status, SessionStatus::Unknown);
        assert!(resp.status.is_live());
        assert!(!SessionStatus::Revoked.is_live());
    }

    #[test]
    fn test_renew_response_accepts_rfc3339_expiry() {
        let resp: RenewResponse = serde_json::from_str(
            r#"{"session_id":"s","new_expires_at":"2023-11-14T22:13:20Z",
                "additional_cost":15,"total_tokens_spent":75}"#,
        )
        .unwrap();
        assert_eq!(resp.new_expires_at, 1_700_000_000);
        assert_eq!(resp.additional_cost, 15.0);
    }

    #[test]
    fn test_heartbeat_request_omits_missing_timestamp() {
        let json = serde_json::to_string(&HeartbeatRequest::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_validate_response_minimal() {
        let resp: ValidateResponse = serde_json::from_str(r#"{"valid":false}"#).unwrap();
        assert!(!resp.valid);
        assert!(resp.session.is_none());
        assert!(resp.remaining_seconds.is_none());
    }
}
