//! Shared fixtures: one in-memory origin, a simulated backend that knows
//! the session, and tabs that record every event they see.

#![allow(dead_code)]

use std::sync::Arc;

use gwsession::{
    EndReason, LifecycleHooks, MemoryOrigin, MemoryTab, SessionConfig, SessionEvent,
    SessionOrchestrator, Subscription, TokioClock,
};
use gwsession_auth::testing::{TestSigner, claims};
use gwsession_backend::InMemoryBackend;
use gwsession_protocol::{Lease, SessionId};
use gwsession_tabs::LeaseStore;
use parking_lot::Mutex;
use url::Url;

pub const T0: u64 = 1_700_000_000;
pub const SESSION: &str = "s1";
pub const MARKETPLACE: &str = "https://marketplace.example.com/apps";

pub fn config() -> SessionConfig {
    SessionConfig {
        api_endpoint: "https://api.example.com".into(),
        marketplace_url: Some(MARKETPLACE.into()),
        ..SessionConfig::default()
    }
}

pub struct Harness {
    pub origin: MemoryOrigin,
    pub backend: Arc<InMemoryBackend>,
    signer: TestSigner,
}

impl Harness {
    /// Must be called inside a (paused) Tokio runtime: the clock anchors
    /// to Tokio time.
    pub fn new() -> Self {
        let clock = Arc::new(TokioClock::new(T0 * 1000));
        let origin = MemoryOrigin::new(clock.clone());
        let backend = Arc::new(InMemoryBackend::new(clock));
        backend.set_jwks(TestSigner::jwks());
        Self {
            origin,
            backend,
            signer: TestSigner::new(),
        }
    }

    /// Signs a token for [`SESSION`] issued at `T0` and registers the
    /// session with the backend.
    pub fn issue(&self, lifetime_secs: u64) -> String {
        let token = self
            .signer
            .sign(&claims(SESSION, T0, T0 + lifetime_secs));
        self.backend.insert_session(
            SESSION,
            &token,
            "app-1",
            "user-1",
            "org-1",
            T0 + lifetime_secs,
        );
        token
    }

    pub fn open(&self, token: &str, config: SessionConfig) -> Tab {
        self.open_with(token, config, LifecycleHooks::default())
    }

    pub fn open_with(&self, token: &str, config: SessionConfig, hooks: LifecycleHooks) -> Tab {
        let url = format!("https://app.example.com/launch?gwSession={token}");
        self.open_url(&url, config, hooks)
    }

    /// A tab on an arbitrary page URL (for missing-token cases).
    pub fn open_url(&self, url: &str, config: SessionConfig, hooks: LifecycleHooks) -> Tab {
        let page = self.origin.open_tab(Url::parse(url).unwrap());
        let session = SessionOrchestrator::builder(config)
            .platform(page.platform())
            .backend(self.backend.clone())
            .hooks(hooks)
            .build()
            .unwrap();
        let events = EventLog::default();
        let sink = events.clone();
        let subscription = session.subscribe(move |event| sink.push(event.clone()));
        Tab {
            page,
            session,
            events,
            _subscription: subscription,
        }
    }

    /// Opens a tab and initializes it, panicking on failure.
    pub async fn start(&self, token: &str, config: SessionConfig) -> Tab {
        let mut tab = self.open(token, config);
        tab.session.initialize().await.unwrap();
        tab
    }

    pub fn stored_lease(&self) -> Option<Lease> {
        LeaseStore::new(
            self.origin.store().clone(),
            "gwsession",
            &SessionId::from(SESSION),
        )
        .read()
        .unwrap()
    }

    pub fn heartbeats(&self) -> usize {
        self.backend.heartbeat_count(SESSION)
    }
}

pub struct Tab {
    pub page: MemoryTab,
    pub session: SessionOrchestrator<InMemoryBackend>,
    pub events: EventLog,
    _subscription: Subscription,
}

/// Every event a tab emitted, in order.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<SessionEvent>>>);

impl EventLog {
    fn push(&self, event: SessionEvent) {
        self.0.lock().push(event);
    }

    pub fn all(&self) -> Vec<SessionEvent> {
        self.0.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn warnings(&self) -> Vec<u64> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Warning { remaining_seconds } => Some(*remaining_seconds),
                _ => None,
            })
            .collect()
    }

    pub fn ended(&self) -> Vec<EndReason> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Ended { reason } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    pub fn redirects(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Redirect { url } => Some(url.clone()),
                _ => None,
            })
            .collect()
    }
}
