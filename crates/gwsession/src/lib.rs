//! # gwsession
//!
//! Time-boxed session lifecycle for applications launched from a
//! marketplace.
//!
//! A user buys a fixed amount of time and is sent to the application with
//! a signed session token in the URL. gwsession turns that token into a
//! running session:
//!
//! - validates the token (RS256 against a cached JWKS, or via the backend)
//! - counts down to the expiry, warns before it, ends the session at zero
//! - keeps the countdown honest with periodic heartbeats to the backend
//! - elects one leader among the tabs showing the same session, so only
//!   one of them talks to the backend, and keeps the others in sync
//! - runs the host's lifecycle hooks and reports events to observers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gwsession::prelude::*;
//! use gwsession::{Platform, SystemClock, MemoryStore};
//!
//! # async fn run() -> Result<(), SessionError> {
//! let config = SessionConfig {
//!     api_endpoint: "https://api.example.com".into(),
//!     marketplace_url: Some("https://marketplace.example.com".into()),
//!     ..SessionConfig::default()
//! };
//! let page = url::Url::parse("https://app.example.com/?gwSession=eyJ...").unwrap();
//! let platform = Platform::new(Arc::new(SystemClock), Arc::new(MemoryStore::new()), page);
//!
//! let mut session = SessionOrchestrator::builder(config.clone())
//!     .platform(platform)
//!     .backend(Arc::new(config.http_backend()?))
//!     .build()?;
//! session.on_warning(|left| println!("{} left", format_remaining(left))).forget();
//! session.on_redirect(|url| println!("go to {url}")).forget();
//!
//! session.initialize().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Crates
//!
//! | Crate | Role |
//! |-------|------|
//! | `gwsession-platform` | Clock, shared store, broadcast channel, visibility |
//! | `gwsession-protocol` | Session record, tab messages, backend payloads |
//! | `gwsession-backend` | The session API (HTTP and in-memory) |
//! | `gwsession-auth` | Token parsing and signature validation |
//! | `gwsession-timer` | The countdown |
//! | `gwsession-heartbeat` | Periodic backend check-ins with backoff |
//! | `gwsession-tabs` | Leader election and cross-tab messages |
//!
//! # Feature Flags
//!
//! - `http` (default) — [`HttpBackend`] and [`SessionConfig::http_backend`].
//! - `memory` — [`InMemoryBackend`], a simulated session API for tests
//!   and demos.

mod config;
mod error;
mod events;
mod hooks;
mod orchestrator;
mod state;

pub use config::SessionConfig;
pub use error::{ErrorKind, SessionError};
pub use events::{SessionEvent, Subscription};
pub use hooks::{HookContext, HookKind, HookResult, LifecycleHooks};
pub use orchestrator::{SessionBuilder, SessionOrchestrator};
pub use state::SessionState;

pub use gwsession_backend::{BackendError, SessionBackend};
#[cfg(feature = "http")]
pub use gwsession_backend::HttpBackend;
#[cfg(feature = "memory")]
pub use gwsession_backend::InMemoryBackend;
pub use gwsession_platform::{
    BroadcastChannel, Clock, MemoryBus, MemoryOrigin, MemoryStore, MemoryTab, Platform,
    SharedStore, SystemClock, TokioClock, Visibility,
};
pub use gwsession_protocol::{
    CompleteResponse, EndReason, RenewResponse, SessionId, SessionRecord, TabId,
};
pub use gwsession_tabs::TabRole;
pub use gwsession_timer::{TimerStatus, format_remaining};

/// The types most embedders need.
pub mod prelude {
    pub use crate::{
        EndReason, ErrorKind, LifecycleHooks, SessionConfig, SessionError, SessionEvent,
        SessionOrchestrator, SessionRecord, SessionState, TabRole, format_remaining,
    };
}
