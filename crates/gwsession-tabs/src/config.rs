//! Coordinator configuration and the tab role.

use std::fmt;
use std::time::Duration;

use tracing::warn;

/// Settings for one [`TabCoordinator`](crate::TabCoordinator).
#[derive(Debug, Clone)]
pub struct TabConfig {
    /// How often the leader renews its lease and broadcasts `TIME_SYNC`.
    /// Followers check the lease four times as often.
    ///
    /// Default: 30 seconds (the heartbeat interval).
    pub sync_interval: Duration,

    /// Upper bound of the random pause between writing the lease and
    /// reading it back during an election.
    ///
    /// Default: 50 ms.
    pub election_jitter: Duration,

    /// Prefix of the lease key in the shared store. The full key is
    /// `{key_prefix}:{session_id}:leader`.
    ///
    /// Default: `"gwsession"`.
    pub key_prefix: String,
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            election_jitter: Duration::from_millis(50),
            key_prefix: "gwsession".to_string(),
        }
    }
}

impl TabConfig {
    pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

    /// Clamps out-of-range values:
    /// - `sync_interval` is at least [`Self::MIN_SYNC_INTERVAL`].
    /// - `election_jitter` is at most a quarter of `sync_interval`.
    /// - an empty `key_prefix` becomes `"gwsession"`.
    pub fn validated(mut self) -> Self {
        if self.sync_interval < Self::MIN_SYNC_INTERVAL {
            warn!(
                sync_interval = ?self.sync_interval,
                "sync interval too short, clamping to 1s"
            );
            self.sync_interval = Self::MIN_SYNC_INTERVAL;
        }
        let max_jitter = self.sync_interval / 4;
        if self.election_jitter > max_jitter {
            warn!(
                election_jitter = ?self.election_jitter,
                "election jitter exceeds a quarter of the sync interval, clamping"
            );
            self.election_jitter = max_jitter;
        }
        if self.key_prefix.is_empty() {
            self.key_prefix = "gwsession".to_string();
        }
        self
    }

    /// How long a written lease stays valid: two sync intervals.
    pub fn lease_duration(&self) -> Duration {
        self.sync_interval * 2
    }

    /// How long a leader may go without renewing its lease before
    /// followers treat it as gone: one and a half sync intervals.
    ///
    /// A lease whose `written_at` is older than this counts as vacant even
    /// if it has not expired, so a follower takes over a crashed leader
    /// within `follower_timeout() + watch_interval()` plus the election
    /// jitter, at most two intervals.
    pub fn follower_timeout(&self) -> Duration {
        self.sync_interval * 3 / 2
    }

    /// How often a follower checks the lease: a quarter sync interval.
    pub fn watch_interval(&self) -> Duration {
        self.sync_interval / 4
    }
}

/// Whether this tab currently drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabRole {
    /// Holds the lease: runs the heartbeat and broadcasts `TIME_SYNC`.
    Leader,
    /// Listens to the leader.
    Follower,
}

impl TabRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl fmt::Display for TabRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}
