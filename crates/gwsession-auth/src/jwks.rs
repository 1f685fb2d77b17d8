//! Time-bounded cache for the signing key set.

use std::time::Duration;

use gwsession_protocol::Jwks;
use parking_lot::Mutex;

#[derive(Debug)]
struct Cached {
    jwks: Jwks,
    fetched_at_ms: u64,
}

/// Holds the last fetched key set for `ttl`.
///
/// Timestamps come from the caller (the platform clock), so expiry follows
/// the same notion of "now" as token expiry.
#[derive(Debug)]
pub struct JwksCache {
    ttl_ms: u64,
    entry: Mutex<Option<Cached>>,
}

impl JwksCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            entry: Mutex::new(None),
        }
    }

    /// The cached set, if one was stored less than `ttl` ago.
    pub fn get(&self, now_ms: u64) -> Option<Jwks> {
        let entry = self.entry.lock();
        let cached = entry.as_ref()?;
        if now_ms.saturating_sub(cached.fetched_at_ms) < self.ttl_ms {
            Some(cached.jwks.clone())
        } else {
            None
        }
    }

    pub fn store(&self, jwks: Jwks, now_ms: u64) {
        *self.entry.lock() = Some(Cached {
            jwks,
            fetched_at_ms: now_ms,
        });
    }

    pub fn invalidate(&self) {
        *self.entry.lock() = None;
    }
}
