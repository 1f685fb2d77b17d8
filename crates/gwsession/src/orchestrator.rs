//! `SessionOrchestrator`: the public handle, its builder, and the actor
//! that runs one tab's session.
//!
//! ```text
//!                  SessionOrchestrator (handle)
//!   initialize() ── validate token, start timer + coordinator, start hook
//!        │                                   │
//!        │  extend/complete: backend call    │ Command (mpsc + oneshot reply)
//!        │  on the caller's task, then ──────┤
//!        ▼                                   ▼
//!                         SessionActor (Tokio task)
//!        select! { timer tick │ coordinator event │ heartbeat event
//!                  │ visibility change │ command }
//! ```
//!
//! Network calls never run on the actor, so a hung request can't stall
//! the countdown. The actor owns the timer, the coordinator and the
//! heartbeat task; aborting it releases all three.

use std::sync::Arc;

use gwsession_auth::TokenValidator;
use gwsession_backend::SessionBackend;
use gwsession_heartbeat::{HeartbeatAgent, HeartbeatEvent, HeartbeatHandle, spawn_heartbeat};
use gwsession_platform::{Clock, Platform, Visibility};
use gwsession_protocol::{
    CompleteResponse, EndReason, RenewResponse, SessionId, SessionRecord, SessionStatus, TabId,
    TabMessage,
};
use gwsession_tabs::{CoordinatorEvent, LeaseStore, TabCoordinator, TabRole, random_tab_id};
use gwsession_timer::{TimerEngine, TimerError, TimerEvent, TimerStatus};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::Observers;
use crate::{
    ErrorKind, HookContext, HookKind, LifecycleHooks, SessionConfig, SessionError, SessionEvent,
    SessionState, Subscription,
};

/// Capacity of the command and heartbeat channels.
const CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a [`SessionOrchestrator`].
///
/// ```rust,ignore
/// let mut session = SessionOrchestrator::builder(config)
///     .platform(platform)
///     .backend(Arc::new(config.http_backend()?))
///     .hooks(hooks)
///     .build()?;
/// session.initialize().await?;
/// ```
pub struct SessionBuilder<B> {
    config: SessionConfig,
    platform: Option<Platform>,
    backend: Option<Arc<B>>,
    hooks: LifecycleHooks,
    tab_id: Option<TabId>,
}

impl<B: SessionBackend> SessionBuilder<B> {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            platform: None,
            backend: None,
            hooks: LifecycleHooks::default(),
            tab_id: None,
        }
    }

    /// The host environment (clock, store, broadcast, page URL). Required.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// The session API client. Required.
    pub fn backend(mut self, backend: Arc<B>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Overrides the random tab id.
    pub fn tab_id(mut self, tab_id: impl Into<TabId>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }

    /// Validates the config and creates the (not yet initialized) session.
    ///
    /// # Errors
    /// [`SessionError::Config`] if the platform or backend is missing or
    /// the config fails [`SessionConfig::check`].
    pub fn build(self) -> Result<SessionOrchestrator<B>, SessionError> {
        let config = self.config.validated();
        config.check()?;
        let platform = self
            .platform
            .ok_or_else(|| SessionError::Config("no platform given".into()))?;
        let backend = self
            .backend
            .ok_or_else(|| SessionError::Config("no backend given".into()))?;

        Ok(SessionOrchestrator {
            config,
            platform,
            backend,
            hooks: self.hooks,
            tab_id: self.tab_id.unwrap_or_else(random_tab_id),
            observers: Arc::new(Observers::default()),
            shared: Arc::new(Mutex::new(Snapshot::default())),
            running: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Shared snapshot and commands
// ---------------------------------------------------------------------------

/// What the handle can read without asking the actor.
#[derive(Debug, Clone)]
struct Snapshot {
    state: SessionState,
    record: Option<SessionRecord>,
    remaining_seconds: u64,
    role: Option<TabRole>,
    timer_status: TimerStatus,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Initializing,
            record: None,
            remaining_seconds: 0,
            role: None,
            timer_status: TimerStatus::Stopped,
        }
    }
}

/// Requests from the handle to the actor. Each carries a reply channel.
enum Command {
    Extend {
        new_expires_at: u64,
        reply: oneshot::Sender<SessionRecord>,
    },
    End {
        reason: EndReason,
        reply: oneshot::Sender<()>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), TimerError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), TimerError>>,
    },
    StartTimer {
        reply: oneshot::Sender<Result<(), TimerError>>,
    },
}

/// Present once `initialize()` succeeded.
struct Running {
    session_id: SessionId,
    token: String,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    leases: Option<LeaseStore>,
}

// ---------------------------------------------------------------------------
// SessionOrchestrator
// ---------------------------------------------------------------------------

/// One tab's session: the public lifecycle API.
///
/// Create it with [`SessionOrchestrator::builder`], register observers,
/// then call [`initialize`](Self::initialize). Dropping the orchestrator
/// tears everything down (see [`teardown`](Self::teardown)).
pub struct SessionOrchestrator<B: SessionBackend> {
    config: SessionConfig,
    platform: Platform,
    backend: Arc<B>,
    hooks: LifecycleHooks,
    tab_id: TabId,
    observers: Arc<Observers>,
    shared: Arc<Mutex<Snapshot>>,
    running: Option<Running>,
}

impl<B: SessionBackend> SessionOrchestrator<B> {
    pub fn builder(config: SessionConfig) -> SessionBuilder<B> {
        SessionBuilder::new(config)
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Reads the token from the page URL, validates it, and starts the
    /// countdown, tab coordination and (on the leader) the heartbeat.
    ///
    /// The `on_session_start` hook runs last; if it fails or times out
    /// the session does not start. Any failure moves the session to
    /// [`SessionState::Error`] and is reported to `on_error` observers
    /// before it is returned.
    ///
    /// # Errors
    /// Every validation failure ([`SessionError::Auth`]), a missing token,
    /// a failing start hook, or [`SessionError::InvalidState`] if called
    /// twice.
    pub async fn initialize(&mut self) -> Result<SessionRecord, SessionError> {
        let state = self.state();
        if state != SessionState::Initializing || self.running.is_some() {
            return Err(SessionError::InvalidState(state));
        }
        match self.start_session().await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn start_session(&mut self) -> Result<SessionRecord, SessionError> {
        let token = self
            .platform
            .query_param(&self.config.jwt_param_name)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SessionError::MissingToken(self.config.jwt_param_name.clone()))?;

        let clock = self.platform.clock().clone();
        let validator = TokenValidator::new(
            self.config.validator_config(),
            clock.clone(),
            self.backend.clone(),
        );
        let record = validator.validate(&token).await?;

        let mut timer = TimerEngine::new(self.config.timer_config(), clock.clone());
        if self.config.auto_start {
            timer.start(record.expires_at)?;
        }

        let mut tabs = None;
        let mut role = TabRole::Leader;
        if self.config.enable_tab_sync {
            let mut coordinator = TabCoordinator::new(
                self.config.tab_config(),
                record.session_id.clone(),
                self.tab_id.clone(),
                &self.platform,
            );
            role = coordinator.start().await;
            tabs = Some(coordinator);
        }

        let ctx = HookContext {
            record: record.clone(),
            remaining_seconds: timer.remaining_seconds(),
            reason: None,
        };
        if let Err(err) = self
            .hooks
            .run(HookKind::SessionStart, ctx, self.config.hook_timeout())
            .await
        {
            if let Some(coordinator) = tabs.as_mut() {
                coordinator.shutdown();
            }
            return Err(err);
        }

        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let leases = tabs.as_ref().map(|c| c.leases().clone());

        let actor = SessionActor {
            config: self.config.clone(),
            backend: self.backend.clone(),
            clock,
            hooks: self.hooks.clone(),
            observers: self.observers.clone(),
            shared: self.shared.clone(),
            tab_id: self.tab_id.clone(),
            record: record.clone(),
            token: token.clone(),
            state: SessionState::Active,
            role,
            timer,
            tabs,
            heartbeat: None,
            heartbeat_tx,
            heartbeat_rx,
            visibility: self.platform.visibility(),
            visibility_open: true,
            commands: commands_rx,
        };
        actor.publish();

        info!(
            session_id = %record.session_id,
            tab_id = %self.tab_id,
            %role,
            expires_at = record.expires_at,
            "session started"
        );
        self.observers.emit(&SessionEvent::Started {
            record: record.clone(),
            role,
        });

        let task = tokio::spawn(actor.run());
        self.running = Some(Running {
            session_id: record.session_id.clone(),
            token,
            commands: commands_tx,
            task,
            leases,
        });
        Ok(record)
    }

    /// Buys `minutes` more through the backend, then updates every tab.
    ///
    /// The `on_session_extend` hook runs afterwards, best-effort.
    ///
    /// # Errors
    /// [`SessionError::InvalidState`] unless the session is live;
    /// [`SessionError::Backend`] if the renewal fails (the session itself
    /// carries on).
    pub async fn extend_session(&self, minutes: u64) -> Result<RenewResponse, SessionError> {
        let running = self.live()?;
        let response = self
            .backend
            .renew(&running.session_id, &running.token, minutes)
            .await
            .map_err(|e| self.report(e.into()))?;

        let new_expires_at = response.new_expires_at;
        let record = self
            .request(|reply| Command::Extend {
                new_expires_at,
                reply,
            })
            .await?;

        let ctx = HookContext {
            record,
            remaining_seconds: self.remaining_seconds(),
            reason: None,
        };
        self.hooks
            .run_best_effort(HookKind::SessionExtend, ctx, self.config.hook_timeout())
            .await;
        Ok(response)
    }

    /// Completes the session through the backend (refunding unused time),
    /// then ends it in every tab.
    ///
    /// # Errors
    /// [`SessionError::InvalidState`] unless the session is live;
    /// [`SessionError::Backend`] if the backend refuses (the session
    /// keeps running).
    pub async fn complete_session(
        &self,
        actual_usage_minutes: Option<u64>,
    ) -> Result<CompleteResponse, SessionError> {
        let running = self.live()?;
        let response = self
            .backend
            .complete(&running.session_id, &running.token, actual_usage_minutes)
            .await
            .map_err(|e| self.report(e.into()))?;

        self.request(|reply| Command::End {
            reason: EndReason::Completed,
            reply,
        })
        .await?;
        Ok(response)
    }

    /// Ends the session locally and in every other tab. Needs no backend.
    ///
    /// Ending a session that is already over is a no-op.
    ///
    /// # Errors
    /// [`SessionError::InvalidState`] before `initialize()` succeeded.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let result = self
            .request(|reply| Command::End {
                reason: EndReason::Manual,
                reply,
            })
            .await;
        match result {
            Err(_) if self.state().is_terminal() => Ok(()),
            other => other,
        }
    }

    /// Pauses this tab's countdown. Other tabs are not told.
    ///
    /// # Errors
    /// [`SessionError::Timer`] if the countdown isn't running.
    pub async fn pause_timer(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| Command::Pause { reply }).await??)
    }

    /// # Errors
    /// [`SessionError::Timer`] if the countdown isn't paused.
    pub async fn resume_timer(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| Command::Resume { reply }).await??)
    }

    /// Starts the countdown of a session initialized with
    /// `auto_start = false`.
    ///
    /// # Errors
    /// [`SessionError::Timer`] if it was already started.
    pub async fn start_timer(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| Command::StartTimer { reply }).await??)
    }

    /// Stops everything this tab runs for the session, synchronously:
    /// the actor (and with it the timer, heartbeat and broadcast
    /// subscription), the observers, and the lease if this tab holds it.
    ///
    /// The session is not ended for other tabs; a follower takes over.
    /// Idempotent, and also run on drop.
    pub fn teardown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.task.abort();
        if let Some(leases) = &running.leases {
            // The aborted actor may still be polled once more on another
            // worker. Closing first keeps it from renewing after the release.
            leases.close();
            match leases.release_if_held(&self.tab_id) {
                Ok(true) => debug!(tab_id = %self.tab_id, "lease released on teardown"),
                Ok(false) => {}
                Err(e) => warn!(tab_id = %self.tab_id, error = %e, "could not release lease"),
            }
        }
        self.observers.clear();
        {
            let mut snapshot = self.shared.lock();
            if !snapshot.state.is_terminal() {
                snapshot.state = SessionState::Ended;
            }
            snapshot.timer_status = TimerStatus::Stopped;
            snapshot.remaining_seconds = 0;
        }
        info!(session_id = %running.session_id, tab_id = %self.tab_id, "session torn down");
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// The validated session, once initialized.
    pub fn record(&self) -> Option<SessionRecord> {
        self.shared.lock().record.clone()
    }

    /// Remaining seconds as of the last tick or correction.
    pub fn remaining_seconds(&self) -> u64 {
        self.shared.lock().remaining_seconds
    }

    /// This tab's role, once initialized.
    pub fn role(&self) -> Option<TabRole> {
        self.shared.lock().role
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn timer_status(&self) -> TimerStatus {
        self.shared.lock().timer_status
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Registers a callback for every [`SessionEvent`].
    pub fn subscribe(
        &self,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.subscribe(callback)
    }

    pub fn on_session_start(
        &self,
        callback: impl Fn(&SessionRecord) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Started { record, .. } = event {
                callback(record);
            }
        })
    }

    pub fn on_tick(&self, callback: impl Fn(u64) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Tick { remaining_seconds } = event {
                callback(*remaining_seconds);
            }
        })
    }

    pub fn on_warning(&self, callback: impl Fn(u64) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Warning { remaining_seconds } = event {
                callback(*remaining_seconds);
            }
        })
    }

    pub fn on_session_end(
        &self,
        callback: impl Fn(EndReason) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Ended { reason } = event {
                callback(*reason);
            }
        })
    }

    pub fn on_error(
        &self,
        callback: impl Fn(ErrorKind, &str) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Error { kind, message } = event {
                callback(*kind, message);
            }
        })
    }

    pub fn on_redirect(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Redirect { url } = event {
                callback(url);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn live(&self) -> Result<&Running, SessionError> {
        let state = self.state();
        match &self.running {
            Some(running) if state.is_live() => Ok(running),
            _ => Err(SessionError::InvalidState(state)),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let Some(running) = &self.running else {
            return Err(SessionError::InvalidState(self.state()));
        };
        let (reply, response) = oneshot::channel();
        if running.commands.send(command(reply)).await.is_err() {
            return Err(SessionError::InvalidState(self.state()));
        }
        response
            .await
            .map_err(|_| SessionError::InvalidState(self.state()))
    }

    /// Surfaces a non-fatal error to `on_error` observers and hands it back.
    fn report(&self, err: SessionError) -> SessionError {
        warn!(tab_id = %self.tab_id, kind = %err.kind(), error = %err, "session operation failed");
        self.observers.emit(&SessionEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
        err
    }

    fn fail(&self, err: &SessionError) {
        self.shared.lock().state = SessionState::Error;
        warn!(tab_id = %self.tab_id, kind = %err.kind(), error = %err, "session failed to start");
        self.observers.emit(&SessionEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
        if let Some(url) = &self.config.marketplace_url {
            self.observers
                .emit(&SessionEvent::Redirect { url: url.clone() });
        }
    }
}

impl<B: SessionBackend> Drop for SessionOrchestrator<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<B: SessionBackend> std::fmt::Debug for SessionOrchestrator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("tab_id", &self.tab_id)
            .field("state", &self.state())
            .field("role", &self.role())
            .field("observers", &self.observers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct SessionActor<B: SessionBackend> {
    config: SessionConfig,
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    hooks: LifecycleHooks,
    observers: Arc<Observers>,
    shared: Arc<Mutex<Snapshot>>,
    tab_id: TabId,
    record: SessionRecord,
    token: String,
    state: SessionState,
    role: TabRole,
    timer: TimerEngine,
    /// `None` with tab sync disabled: this tab always leads.
    tabs: Option<TabCoordinator>,
    heartbeat: Option<HeartbeatHandle>,
    heartbeat_tx: mpsc::Sender<HeartbeatEvent>,
    heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
    visibility: watch::Receiver<Visibility>,
    visibility_open: bool,
    commands: mpsc::Receiver<Command>,
}

impl<B: SessionBackend> SessionActor<B> {
    async fn run(mut self) {
        debug!(session_id = %self.record.session_id, tab_id = %self.tab_id, "session actor started");
        self.sync_heartbeat();
        let initial = *self.visibility.borrow_and_update();
        self.on_visibility(initial);

        while !self.state.is_terminal() {
            tokio::select! {
                events = self.timer.wait_for_tick() => self.on_timer(events).await,
                event = next_tab_event(self.tabs.as_mut()) => self.on_tab_event(event).await,
                Some(event) = self.heartbeat_rx.recv() => self.on_heartbeat(event).await,
                changed = self.visibility.changed(), if self.visibility_open => match changed {
                    Ok(()) => {
                        let visibility = *self.visibility.borrow_and_update();
                        self.on_visibility(visibility);
                    }
                    Err(_) => self.visibility_open = false,
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!(tab_id = %self.tab_id, "handle dropped, stopping");
                        self.shut_down();
                        break;
                    }
                },
            }
        }
        debug!(session_id = %self.record.session_id, tab_id = %self.tab_id, "session actor stopped");
    }

    // -- timer --------------------------------------------------------------

    async fn on_timer(&mut self, events: Vec<TimerEvent>) {
        for event in events {
            match event {
                TimerEvent::Tick { remaining_seconds } => {
                    self.publish();
                    self.observers
                        .emit(&SessionEvent::Tick { remaining_seconds });
                }
                TimerEvent::Warning { remaining_seconds } => {
                    let ctx = self.hook_context(None);
                    self.hooks
                        .run_best_effort(HookKind::SessionWarning, ctx, self.config.hook_timeout())
                        .await;
                    self.transition(SessionState::Warning);
                    self.observers
                        .emit(&SessionEvent::Warning { remaining_seconds });
                }
                TimerEvent::Expired => self.finish(EndReason::Expired, true).await,
            }
        }
    }

    fn on_visibility(&mut self, visibility: Visibility) {
        if self.timer.on_visibility(visibility) {
            debug!(tab_id = %self.tab_id, %visibility, status = %self.timer.status(), "visibility changed the countdown");
            self.publish();
        }
    }

    // -- other tabs ---------------------------------------------------------

    async fn on_tab_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Message { from, message } => match message {
                TabMessage::TimeSync { remaining_seconds } => {
                    if let Some(r) = self.timer.reconcile(remaining_seconds) {
                        debug!(%from, previous = r.previous, applied = r.applied, "time sync applied");
                    }
                    self.publish();
                }
                TabMessage::SessionExtended { new_expires_at } => {
                    self.apply_extension(new_expires_at, false);
                }
                TabMessage::SessionEnded { reason } => {
                    info!(tab_id = %self.tab_id, %from, %reason, "session ended by another tab");
                    self.finish(reason, false).await;
                }
                TabMessage::LeaderAnnounce { .. } => {}
            },
            CoordinatorEvent::SyncDue => {
                if self.timer.status() == TimerStatus::Running {
                    let remaining_seconds = self.timer.remaining_seconds();
                    self.broadcast(TabMessage::TimeSync { remaining_seconds });
                }
            }
            CoordinatorEvent::RoleChanged(role) => {
                self.role = role;
                self.sync_heartbeat();
                self.publish();
                self.observers.emit(&SessionEvent::RoleChanged { role });
            }
        }
    }

    // -- heartbeat ----------------------------------------------------------

    async fn on_heartbeat(&mut self, event: HeartbeatEvent) {
        match event {
            HeartbeatEvent::Acknowledged {
                remaining_seconds, ..
            } => {
                if let Some(r) = self.timer.reconcile(remaining_seconds) {
                    debug!(previous = r.previous, applied = r.applied, "heartbeat corrected the countdown");
                }
                self.publish();
                if self.role.is_leader() {
                    self.broadcast(TabMessage::TimeSync { remaining_seconds });
                }
            }
            HeartbeatEvent::Failed { .. } => {}
            HeartbeatEvent::Terminated { status, reason } => {
                let end = match status {
                    Some(SessionStatus::Expired) => EndReason::Expired,
                    Some(SessionStatus::Completed) => EndReason::Completed,
                    _ => EndReason::Revoked,
                };
                warn!(session_id = %self.record.session_id, %reason, "backend ended the session");
                self.finish(end, true).await;
            }
        }
    }

    /// Runs the heartbeat iff this tab leads a counting, live session.
    fn sync_heartbeat(&mut self) {
        let wanted = self.config.enable_heartbeat
            && self.role.is_leader()
            && self.state.is_live()
            && matches!(
                self.timer.status(),
                TimerStatus::Running | TimerStatus::Paused
            );
        if wanted && self.heartbeat.is_none() {
            let agent = HeartbeatAgent::new(
                self.config.heartbeat_config(),
                self.backend.clone(),
                self.clock.clone(),
                self.record.session_id.clone(),
                self.token.clone(),
            );
            self.heartbeat = Some(spawn_heartbeat(agent, self.heartbeat_tx.clone()));
        } else if !wanted {
            if let Some(heartbeat) = self.heartbeat.take() {
                heartbeat.stop();
                debug!(tab_id = %self.tab_id, "heartbeat stopped");
            }
        }
    }

    // -- commands -----------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Extend {
                new_expires_at,
                reply,
            } => {
                self.apply_extension(new_expires_at, true);
                let _ = reply.send(self.record.clone());
            }
            Command::End { reason, reply } => {
                self.finish(reason, true).await;
                let _ = reply.send(());
            }
            Command::Pause { reply } => {
                let result = self.timer.pause();
                self.publish();
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let result = self.timer.resume();
                self.publish();
                let _ = reply.send(result);
            }
            Command::StartTimer { reply } => {
                let result = self.timer.start(self.record.expires_at);
                self.sync_heartbeat();
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    // -- shared steps -------------------------------------------------------

    /// Moves the expiry to `new_expires_at`. `announce` is set when the
    /// extension happened here and other tabs need to hear about it.
    fn apply_extension(&mut self, new_expires_at: u64, announce: bool) {
        if new_expires_at == self.record.expires_at && !announce {
            return;
        }
        if !self.record.extend_to(new_expires_at) {
            warn!(new_expires_at, issued_at = self.record.issued_at, "ignoring extension before issue time");
            return;
        }
        self.timer.reconcile_expiry(new_expires_at);
        if self.timer.rearm_warning() && self.state == SessionState::Warning {
            self.transition(SessionState::Active);
        }
        self.publish();
        if announce {
            self.broadcast(TabMessage::SessionExtended { new_expires_at });
        }
        info!(session_id = %self.record.session_id, new_expires_at, "session extended");
        self.observers
            .emit(&SessionEvent::Extended { new_expires_at });
    }

    async fn finish(&mut self, reason: EndReason, announce: bool) {
        if !self.state.is_live() {
            return;
        }
        let ctx = self.hook_context(Some(reason));
        self.transition(SessionState::Ending);
        self.timer.stop();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if announce {
            self.broadcast(TabMessage::SessionEnded { reason });
        }

        self.hooks
            .run_best_effort(HookKind::SessionEnd, ctx, self.config.hook_timeout())
            .await;

        if let Some(tabs) = self.tabs.as_mut() {
            tabs.shutdown();
        }
        self.transition(SessionState::Ended);
        info!(session_id = %self.record.session_id, tab_id = %self.tab_id, %reason, "session ended");
        self.observers.emit(&SessionEvent::Ended { reason });
        if let Some(url) = &self.config.marketplace_url {
            self.observers
                .emit(&SessionEvent::Redirect { url: url.clone() });
        }
    }

    /// The handle is gone: stop without ending the session for others.
    fn shut_down(&mut self) {
        self.timer.stop();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(tabs) = self.tabs.as_mut() {
            tabs.shutdown();
        }
    }

    fn broadcast(&mut self, message: TabMessage) {
        if let Some(tabs) = self.tabs.as_mut() {
            if let Err(e) = tabs.broadcast(message) {
                debug!(tab_id = %self.tab_id, error = %e, "broadcast failed");
            }
        }
    }

    fn transition(&mut self, target: SessionState) {
        if self.state.can_transition_to(target) {
            info!(tab_id = %self.tab_id, from = %self.state, to = %target, "session state");
            self.state = target;
            self.publish();
        } else if self.state != target {
            debug!(from = %self.state, to = %target, "transition not allowed");
        }
    }

    fn hook_context(&self, reason: Option<EndReason>) -> HookContext {
        HookContext {
            record: self.record.clone(),
            remaining_seconds: self.timer.remaining_seconds(),
            reason,
        }
    }

    fn publish(&self) {
        let mut snapshot = self.shared.lock();
        snapshot.state = self.state;
        snapshot.record = Some(self.record.clone());
        snapshot.remaining_seconds = self.timer.remaining_seconds();
        snapshot.role = Some(self.role);
        snapshot.timer_status = self.timer.status();
    }
}

async fn next_tab_event(tabs: Option<&mut TabCoordinator>) -> CoordinatorEvent {
    match tabs {
        Some(tabs) => tabs.next_event().await,
        None => std::future::pending().await,
    }
}
