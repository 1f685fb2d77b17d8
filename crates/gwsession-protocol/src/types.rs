//! Session and cross-tab message types.
//!
//! Two kinds of data leave a tab: the [`TabEnvelope`]s it broadcasts to
//! its sibling tabs, and the [`Lease`] it writes into the shared store.
//! Both are defined here, together with the [`SessionRecord`] every tab
//! builds from the validated JWT.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Opaque session identifier issued by the backend.
///
/// Newtype over `String` so a session id can't be passed where a tab id is
/// expected. `#[serde(transparent)]` keeps the JSON a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Random identifier a tab picks for itself at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Claims and session record
// ---------------------------------------------------------------------------

/// The payload segment of a session JWT.
///
/// Field names follow what the marketplace backend issues; the aliases
/// accept the camelCase spellings older tokens used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(alias = "sid", alias = "jti", alias = "sessionId")]
    pub session_id: String,

    #[serde(default, alias = "application_id", alias = "appId")]
    pub app_id: String,

    #[serde(default, alias = "userId")]
    pub user_id: String,

    #[serde(default, alias = "orgId")]
    pub org_id: String,

    #[serde(default, alias = "durationMinutes", skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u64>,

    #[serde(default)]
    pub iss: String,

    #[serde(default)]
    pub sub: String,

    /// Issued-at, Unix seconds.
    pub iat: u64,

    /// Expiry, Unix seconds.
    pub exp: u64,
}

/// A validated session, as held by every tab.
///
/// Immutable except for `expires_at`, which only moves when the session is
/// extended. All timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub application_id: String,
    pub user_id: String,
    pub org_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub duration_minutes: u64,
    pub issuer: String,
    pub subject: String,
}

impl SessionRecord {
    /// Builds a record from token claims.
    ///
    /// `duration_minutes` falls back to `(exp - iat) / 60` when the token
    /// doesn't carry it.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidMessage`] if `exp <= iat` or the session id
    /// is empty.
    pub fn from_claims(claims: &SessionClaims) -> Result<Self, ProtocolError> {
        if claims.session_id.is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "token carries no session id".into(),
            ));
        }
        if claims.exp <= claims.iat {
            return Err(ProtocolError::InvalidMessage(format!(
                "exp ({}) must be after iat ({})",
                claims.exp, claims.iat
            )));
        }
        let duration_minutes = claims
            .duration_minutes
            .unwrap_or((claims.exp - claims.iat) / 60);
        Ok(Self {
            session_id: SessionId(claims.session_id.clone()),
            application_id: claims.app_id.clone(),
            user_id: claims.user_id.clone(),
            org_id: claims.org_id.clone(),
            issued_at: claims.iat,
            expires_at: claims.exp,
            duration_minutes,
            issuer: claims.iss.clone(),
            subject: claims.sub.clone(),
        })
    }

    /// Seconds left at `now_secs`, never negative.
    pub fn remaining_at(&self, now_secs: u64) -> u64 {
        self.expires_at.saturating_sub(now_secs)
    }

    /// Moves the expiry. Returns `false` (and leaves the record alone) if
    /// the new expiry would not be after `issued_at`.
    pub fn extend_to(&mut self, new_expires_at: u64) -> bool {
        if new_expires_at <= self.issued_at {
            return false;
        }
        self.expires_at = new_expires_at;
        true
    }
}

// ---------------------------------------------------------------------------
// EndReason
// ---------------------------------------------------------------------------

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The countdown reached zero.
    Expired,
    /// The user or host ended it locally.
    Manual,
    /// The session was completed through the backend.
    Completed,
    /// The backend no longer recognizes the session.
    Revoked,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Manual => write!(f, "manual"),
            Self::Completed => write!(f, "completed"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-tab messages
// ---------------------------------------------------------------------------

/// A message one tab broadcasts to the others.
///
/// Internally tagged with SCREAMING_SNAKE_CASE names so the JSON reads
/// `{"type":"TIME_SYNC","remaining_seconds":120}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    /// The sender holds the leadership lease until `lease_expires_at` (ms).
    LeaderAnnounce { lease_expires_at: u64 },

    /// The leader's authoritative remaining time.
    TimeSync { remaining_seconds: u64 },

    /// The session was extended; `new_expires_at` is Unix seconds.
    SessionExtended { new_expires_at: u64 },

    /// The session is over. Every tab must honor this.
    SessionEnded { reason: EndReason },
}

/// The wrapper every [`TabMessage`] travels in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabEnvelope {
    /// Session the message belongs to. Tabs ignore other sessions.
    pub session_id: SessionId,
    /// Sending tab.
    pub from: TabId,
    /// Sender's clock at send time, Unix milliseconds.
    pub sent_at: u64,
    pub message: TabMessage,
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// The leadership lease as stored in the shared store.
///
/// All timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub tab_id: TabId,
    pub lease_expires_at: u64,
    pub written_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.lease_expires_at
    }

    pub fn is_held_by(&self, tab_id: &TabId) -> bool {
        &self.tab_id == tab_id
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> SessionClaims {
        SessionClaims {
            session_id: "sess-1".into(),
            app_id: "app-9".into(),
            user_id: "user-3".into(),
            org_id: "org-5".into(),
            duration_minutes: None,
            iss: "https://api.example.com".into(),
            sub: "user-3".into(),
            iat: 1_000,
            exp: 1_000 + 3_600,
        }
    }

    #[test]
    fn test_from_claims_copies_fields_and_derives_duration() {
        let record = SessionRecord::from_claims(&claims()).unwrap();
        assert_eq!(record.session_id, SessionId::from("sess-1"));
        assert_eq!(record.application_id, "app-9");
        assert_eq!(record.issued_at, 1_000);
        assert_eq!(record.expires_at, 4_600);
        assert_eq!(record.duration_minutes, 60);
    }

    #[test]
    fn test_from_claims_prefers_explicit_duration() {
        let mut c = claims();
        c.duration_minutes = Some(45);
        let record = SessionRecord::from_claims(&c).unwrap();
        assert_eq!(record.duration_minutes, 45);
    }

    #[test]
    fn test_from_claims_rejects_exp_not_after_iat() {
        let mut c = claims();
        c.exp = c.iat;
        assert!(matches!(
            SessionRecord::from_claims(&c),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_from_claims_rejects_empty_session_id() {
        let mut c = claims();
        c.session_id.clear();
        assert!(SessionRecord::from_claims(&c).is_err());
    }

    #[test]
    fn test_claims_accept_camel_case_aliases() {
        let json = r#"{"sessionId":"s","appId":"a","userId":"u","orgId":"o",
                       "durationMinutes":30,"iat":10,"exp":1810}"#;
        let c: SessionClaims = serde_json::from_str(json).unwrap();
        assert_eq!(c.session_id, "s");
        assert_eq!(c.app_id, "a");
        assert_eq!(c.duration_minutes, Some(30));
    }

    #[test]
    fn test_remaining_at_saturates() {
        let record = SessionRecord::from_claims(&claims()).unwrap();
        assert_eq!(record.remaining_at(4_000), 600);
        assert_eq!(record.remaining_at(10_000), 0);
    }

    #[test]
    fn test_extend_to_moves_expiry_forward() {
        let mut record = SessionRecord::from_claims(&claims()).unwrap();
        assert!(record.extend_to(5_500));
        assert_eq!(record.expires_at, 5_500);
        assert!(!record.extend_to(500));
        assert_eq!(record.expires_at, 5_500);
    }

    #[test]
    fn test_tab_message_json_shape() {
        let json = serde_json::to_value(TabMessage::TimeSync {
            remaining_seconds: 120,
        })
        .unwrap();
        assert_eq!(json["type"], "TIME_SYNC");
        assert_eq!(json["remaining_seconds"], 120);

        let json = serde_json::to_value(TabMessage::SessionEnded {
            reason: EndReason::Completed,
        })
        .unwrap();
        assert_eq!(json["type"], "SESSION_ENDED");
        assert_eq!(json["reason"], "completed");
    }

    #[test]
    fn test_leader_announce_json_shape() {
        let json = serde_json::to_value(TabMessage::LeaderAnnounce {
            lease_expires_at: 99,
        })
        .unwrap();
        assert_eq!(json["type"], "LEADER_ANNOUNCE");
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        assert_eq!(
            serde_json::to_string(&TabId::from("t-1")).unwrap(),
            "\"t-1\""
        );
        assert_eq!(SessionId::from("s-1").to_string(), "s-1");
    }

    #[test]
    fn test_lease_expiry_and_holder() {
        let lease = Lease {
            tab_id: TabId::from("a"),
            lease_expires_at: 2_000,
            written_at: 1_000,
        };
        assert!(!lease.is_expired(1_999));
        assert!(lease.is_expired(2_000));
        assert!(lease.is_held_by(&TabId::from("a")));
        assert!(!lease.is_held_by(&TabId::from("b")));
    }

    #[test]
    fn test_end_reason_display() {
        assert_eq!(EndReason::Revoked.to_string(), "revoked");
        assert_eq!(EndReason::Expired.to_string(), "expired");
    }
}
