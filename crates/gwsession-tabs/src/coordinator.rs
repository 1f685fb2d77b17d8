//! The tab coordinator: election, lease upkeep and cross-tab messages.
//!
//! ```text
//!            start()
//!               │
//!        ┌──────▼──────┐  lease held by another tab, unexpired
//!        │  election   ├────────────────────────────────────┐
//!        └──────┬──────┘                                    │
//!    write lease, sleep(jitter), read back                  │
//!               │                                           │
//!     ours ─────┴───── theirs                               │
//!       │                 │                                 ▼
//!   ┌───▼────┐        ┌───▼──────┐  lease vacant, or not   ┌──────────┐
//!   │ Leader │        │ Follower │◄─ renewed for 1.5×interval ┤ Follower │
//!   └───┬────┘        └──────────┘        → election        └──────────┘
//!       │ every interval: renew lease, SyncDue
//!       │ another tab holds the lease → step down
//! ```
//!
//! Followers check the lease every quarter interval. A lease that has
//! gone unrenewed for [`TabConfig::follower_timeout`] is treated as
//! vacant even before it expires, which keeps takeover after a crash
//! under two sync intervals however late the follower joined.
//!
//! All store and channel work is synchronous. The only waits are on the
//! inbox, the maintenance interval and the read-back deadline, so
//! [`TabCoordinator::next_event`] can sit in a `select!` and be dropped at
//! any time without losing an election halfway through.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use gwsession_platform::{BroadcastChannel, BroadcastReceiver, Clock, Platform};
use gwsession_protocol::{
    Codec, JsonCodec, Lease, SessionId, TabEnvelope, TabId, TabMessage,
};
use rand::Rng;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::{CoordinatorError, LeaseStore, TabConfig, TabRole};

/// Generates a fresh tab identifier: 16 random hex digits.
pub fn random_tab_id() -> TabId {
    let n: u64 = rand::rng().random();
    TabId(format!("{n:016x}"))
}

/// What the coordinator reports to the session that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Another tab of this session sent a message. `TIME_SYNC` values are
    /// already reduced by the time the message spent in transit.
    Message { from: TabId, message: TabMessage },

    /// This tab leads and its lease was just renewed. The owner should
    /// broadcast the current remaining time.
    SyncDue,

    /// This tab's role changed after `start()`.
    RoleChanged(TabRole),
}

enum ElectionStep {
    Decided(TabRole),
    ReadBackAt(Instant),
}

/// One tab's view of the leadership protocol for one session.
pub struct TabCoordinator {
    config: TabConfig,
    session_id: SessionId,
    tab_id: TabId,
    clock: Arc<dyn Clock>,
    leases: LeaseStore,
    channel: Option<Arc<dyn BroadcastChannel>>,
    inbox: Option<BroadcastReceiver>,
    codec: JsonCodec,
    role: TabRole,
    single_tab: bool,
    lease_expires_at: Option<u64>,
    /// Last time (ms) another tab proved a leader exists.
    last_heard_at: u64,
    maintenance: Option<Interval>,
    read_back_at: Option<Instant>,
    pending: VecDeque<CoordinatorEvent>,
}

impl TabCoordinator {
    pub fn new(
        config: TabConfig,
        session_id: SessionId,
        tab_id: TabId,
        platform: &Platform,
    ) -> Self {
        let config = config.validated();
        let leases = LeaseStore::new(platform.store().clone(), &config.key_prefix, &session_id);
        Self {
            config,
            session_id,
            tab_id,
            clock: platform.clock().clone(),
            leases,
            channel: platform.channel().cloned(),
            inbox: None,
            codec: JsonCodec,
            role: TabRole::Follower,
            single_tab: false,
            lease_expires_at: None,
            last_heard_at: 0,
            maintenance: None,
            read_back_at: None,
            pending: VecDeque::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> TabRole {
        self.role
    }

    /// Whether coordination has been given up and this tab leads alone.
    pub fn is_single_tab(&self) -> bool {
        self.single_tab
    }

    /// When this tab's lease runs out (ms), while it leads.
    pub fn lease_expires_at(&self) -> Option<u64> {
        self.lease_expires_at
    }

    /// The lease record handle. Clone it to release the lease from a
    /// context that can't reach the coordinator.
    pub fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    pub fn config(&self) -> &TabConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Subscribes to the broadcast channel and runs the first election.
    ///
    /// Calling `start()` again returns the current role without a new
    /// election.
    pub async fn start(&mut self) -> TabRole {
        if self.maintenance.is_some() {
            return self.role;
        }

        match self.channel.as_ref().map(|channel| channel.subscribe()) {
            Some(Ok(inbox)) => self.inbox = Some(inbox),
            Some(Err(e)) => self.enter_single_tab(&e.to_string()),
            None => self.enter_single_tab("no broadcast channel"),
        }

        let role = match self.begin_election() {
            ElectionStep::Decided(role) => role,
            ElectionStep::ReadBackAt(at) => {
                tokio::time::sleep_until(at).await;
                self.finish_election()
            }
        };
        self.role = role;
        self.last_heard_at = self.clock.now_ms();
        self.arm_maintenance();

        tracing::info!(
            session_id = %self.session_id,
            tab_id = %self.tab_id,
            %role,
            single_tab = self.single_tab,
            "tab coordinator started"
        );
        if role.is_leader() {
            self.announce();
        }
        role
    }

    /// Stops coordinating and releases the lease if this tab still holds
    /// it. Returns whether a lease was removed.
    pub fn shutdown(&mut self) -> bool {
        self.maintenance = None;
        self.inbox = None;
        self.read_back_at = None;
        self.pending.clear();
        self.role = TabRole::Follower;
        self.lease_expires_at = None;

        match self.leases.release_if_held(&self.tab_id) {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    tab_id = %self.tab_id,
                    error = %e,
                    "could not release lease"
                );
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends `message` to every other tab of this session.
    ///
    /// In single-tab mode this is a no-op. If the channel fails, the
    /// coordinator drops to single-tab mode and returns the error.
    pub fn broadcast(&mut self, message: TabMessage) -> Result<(), CoordinatorError> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        let envelope = TabEnvelope {
            session_id: self.session_id.clone(),
            from: self.tab_id.clone(),
            sent_at: self.clock.now_ms(),
            message,
        };
        let bytes = self.codec.encode(&envelope)?;

        if let Err(e) = channel.send(&bytes) {
            self.enter_single_tab(&e.to_string());
            self.take_over();
            return Err(CoordinatorError::Broadcast(e));
        }
        tracing::debug!(
            session_id = %self.session_id,
            tab_id = %self.tab_id,
            message = ?envelope.message,
            "broadcast"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Waits for the next thing the owner needs to act on.
    ///
    /// Never completes before [`start`](Self::start). Cancel safe.
    pub async fn next_event(&mut self) -> CoordinatorEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            tokio::select! {
                received = recv_from(self.inbox.as_mut()) => match received {
                    Some(bytes) => self.on_bytes(&bytes),
                    None => {
                        self.enter_single_tab("broadcast channel closed");
                        self.take_over();
                    }
                },
                _ = tick(self.maintenance.as_mut()) => self.maintain(),
                _ = wait_until(self.read_back_at) => {
                    let role = self.finish_election();
                    self.last_heard_at = self.clock.now_ms();
                    self.apply_role(role);
                }
            }
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        let envelope: TabEnvelope = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(tab_id = %self.tab_id, error = %e, "ignoring undecodable tab message");
                return;
            }
        };
        if envelope.session_id != self.session_id || envelope.from == self.tab_id {
            return;
        }

        let now = self.clock.now_ms();
        tracing::debug!(
            session_id = %self.session_id,
            tab_id = %self.tab_id,
            from = %envelope.from,
            message = ?envelope.message,
            "received"
        );
        match envelope.message {
            TabMessage::LeaderAnnounce { .. } => {
                self.last_heard_at = now;
                if self.role.is_leader() {
                    self.resolve_conflict(&envelope.from);
                }
            }
            TabMessage::TimeSync { remaining_seconds } => {
                self.last_heard_at = now;
                if self.role.is_leader() {
                    self.resolve_conflict(&envelope.from);
                }
                let transit_secs = now.saturating_sub(envelope.sent_at) / 1000;
                self.pending.push_back(CoordinatorEvent::Message {
                    from: envelope.from,
                    message: TabMessage::TimeSync {
                        remaining_seconds: remaining_seconds.saturating_sub(transit_secs),
                    },
                });
            }
            message => self.pending.push_back(CoordinatorEvent::Message {
                from: envelope.from,
                message,
            }),
        }
    }

    /// Another tab acts as leader while this one does too. Whoever the
    /// store names keeps the role.
    fn resolve_conflict(&mut self, other: &TabId) {
        match self.leases.read() {
            Ok(Some(lease)) if lease.is_held_by(&self.tab_id) => {
                tracing::debug!(
                    tab_id = %self.tab_id,
                    %other,
                    "another tab claims leadership but the lease is ours"
                );
                self.announce();
            }
            Ok(_) => self.step_down(other),
            Err(e) => {
                tracing::warn!(tab_id = %self.tab_id, error = %e, "lease unreadable during conflict");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    fn maintain(&mut self) {
        if self.single_tab {
            return;
        }
        let now = self.clock.now_ms();
        match self.role {
            TabRole::Leader => self.renew(now),
            TabRole::Follower => self.watch_leader(now),
        }
    }

    /// Leaders wake once per sync interval, followers four times as often.
    fn arm_maintenance(&mut self) {
        let period = match self.role {
            TabRole::Leader => self.config.sync_interval,
            TabRole::Follower => self.config.watch_interval(),
        };
        let mut maintenance = tokio::time::interval_at(Instant::now() + period, period);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.maintenance = Some(maintenance);
    }

    /// Whether another tab may claim `lease`: it has expired, or its
    /// holder stopped renewing it.
    fn is_vacant(&self, lease: &Lease, now: u64) -> bool {
        let stale_ms = duration_ms(self.config.follower_timeout());
        lease.is_expired(now) || now.saturating_sub(lease.written_at) >= stale_ms
    }

    fn renew(&mut self, now: u64) {
        match self.leases.read() {
            Ok(Some(lease)) if !lease.is_held_by(&self.tab_id) && !self.is_vacant(&lease, now) => {
                self.step_down(&lease.tab_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                self.enter_single_tab(&e.to_string());
                return;
            }
        }

        let lease = self.lease_from(now);
        if let Err(e) = self.leases.write(&lease) {
            self.enter_single_tab(&e.to_string());
            return;
        }
        self.lease_expires_at = Some(lease.lease_expires_at);
        tracing::trace!(tab_id = %self.tab_id, expires_at = lease.lease_expires_at, "lease renewed");
        self.pending.push_back(CoordinatorEvent::SyncDue);
    }

    fn watch_leader(&mut self, now: u64) {
        if self.read_back_at.is_some() {
            return;
        }
        let vacant = match self.leases.read() {
            Ok(Some(lease)) => self.is_vacant(&lease, now),
            Ok(None) => true,
            Err(e) => {
                self.enter_single_tab(&e.to_string());
                self.take_over();
                return;
            }
        };
        let timeout_ms = duration_ms(self.config.follower_timeout());
        let silent = now.saturating_sub(self.last_heard_at) >= timeout_ms;
        if !vacant && !silent {
            return;
        }

        tracing::debug!(tab_id = %self.tab_id, vacant, silent, "re-running election");
        match self.begin_election() {
            ElectionStep::Decided(role) => {
                self.last_heard_at = now;
                self.apply_role(role);
            }
            ElectionStep::ReadBackAt(at) => self.read_back_at = Some(at),
        }
    }

    // -----------------------------------------------------------------------
    // Election
    // -----------------------------------------------------------------------

    fn begin_election(&mut self) -> ElectionStep {
        if self.single_tab {
            return ElectionStep::Decided(TabRole::Leader);
        }
        let now = self.clock.now_ms();
        match self.leases.read() {
            Ok(Some(lease)) if !self.is_vacant(&lease, now) && !lease.is_held_by(&self.tab_id) => {
                tracing::debug!(tab_id = %self.tab_id, holder = %lease.tab_id, "lease held elsewhere");
                return ElectionStep::Decided(TabRole::Follower);
            }
            Ok(_) => {}
            Err(e) => {
                self.enter_single_tab(&e.to_string());
                return ElectionStep::Decided(TabRole::Leader);
            }
        }

        if let Err(e) = self.leases.write(&self.lease_from(now)) {
            self.enter_single_tab(&e.to_string());
            return ElectionStep::Decided(TabRole::Leader);
        }
        ElectionStep::ReadBackAt(Instant::now() + self.jitter())
    }

    fn finish_election(&mut self) -> TabRole {
        self.read_back_at = None;
        match self.leases.read() {
            Ok(Some(lease)) if lease.is_held_by(&self.tab_id) => {
                self.lease_expires_at = Some(lease.lease_expires_at);
                TabRole::Leader
            }
            Ok(_) => {
                self.lease_expires_at = None;
                TabRole::Follower
            }
            Err(e) => {
                self.enter_single_tab(&e.to_string());
                TabRole::Leader
            }
        }
    }

    fn lease_from(&self, now: u64) -> Lease {
        Lease {
            tab_id: self.tab_id.clone(),
            lease_expires_at: now.saturating_add(duration_ms(self.config.lease_duration())),
            written_at: now,
        }
    }

    fn jitter(&self) -> Duration {
        let max = duration_ms(self.config.election_jitter);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    // -----------------------------------------------------------------------
    // Role changes
    // -----------------------------------------------------------------------

    fn apply_role(&mut self, role: TabRole) {
        if role == self.role {
            return;
        }
        self.role = role;
        tracing::info!(session_id = %self.session_id, tab_id = %self.tab_id, %role, "role changed");
        if self.maintenance.is_some() {
            self.arm_maintenance();
        }
        self.pending.push_back(CoordinatorEvent::RoleChanged(role));
        if role.is_leader() {
            self.announce();
        }
    }

    fn step_down(&mut self, holder: &TabId) {
        tracing::info!(tab_id = %self.tab_id, %holder, "another tab holds the lease, stepping down");
        self.lease_expires_at = None;
        self.last_heard_at = self.clock.now_ms();
        self.apply_role(TabRole::Follower);
    }

    fn take_over(&mut self) {
        self.apply_role(TabRole::Leader);
    }

    fn enter_single_tab(&mut self, reason: &str) {
        if !self.single_tab {
            tracing::warn!(
                session_id = %self.session_id,
                tab_id = %self.tab_id,
                %reason,
                "tab sync unavailable, running as a single tab"
            );
        }
        self.single_tab = true;
        self.channel = None;
        self.inbox = None;
        self.read_back_at = None;
    }

    fn announce(&mut self) {
        let Some(lease_expires_at) = self.lease_expires_at else {
            return;
        };
        if let Err(e) = self.broadcast(TabMessage::LeaderAnnounce { lease_expires_at }) {
            tracing::debug!(tab_id = %self.tab_id, error = %e, "leader announce not sent");
        }
    }
}

impl std::fmt::Debug for TabCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabCoordinator")
            .field("session_id", &self.session_id)
            .field("tab_id", &self.tab_id)
            .field("role", &self.role)
            .field("single_tab", &self.single_tab)
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn recv_from(inbox: Option<&mut BroadcastReceiver>) -> Option<Vec<u8>> {
    match inbox {
        Some(inbox) => inbox.recv().await,
        None => pending().await,
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
