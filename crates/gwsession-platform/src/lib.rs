//! Platform adapter for gwsession.
//!
//! The session engine was designed for a browser tab, but nothing in the
//! state machines needs a browser. This crate is the seam: the handful of
//! browser globals the engine touches are expressed as small traits and
//! bundled into a [`Platform`] value.
//!
//! | Browser global            | Adapter                     |
//! |---------------------------|-----------------------------|
//! | `Date.now()`              | [`Clock`]                   |
//! | `localStorage`            | [`SharedStore`]             |
//! | `BroadcastChannel`        | [`BroadcastChannel`]        |
//! | `visibilitychange`        | [`Visibility`] watch        |
//! | `window.location`         | [`Platform::location`]      |
//!
//! Timers are not part of the adapter: the engine schedules work with
//! Tokio's timer, which is already pluggable (and pausable in tests).
//!
//! ## Why traits, and why these bounds
//!
//! Each adapter is a trait object (`Arc<dyn Clock>`, `Arc<dyn
//! SharedStore>`, `Arc<dyn BroadcastChannel>`) rather than a generic
//! parameter. A session holds one of each for its whole life, and making
//! them generic would thread three extra type parameters through the
//! timer, the coordinator and the orchestrator for no runtime gain. The
//! cost is one virtual call per read, which is noise next to a
//! `localStorage` access.
//!
//! Every trait requires `Send + Sync + 'static`. The session actor is a
//! spawned Tokio task, so whatever it owns must be movable to another
//! worker thread (`Send`), shareable between the actor and the handle
//! that tears it down (`Sync`), and free of borrowed data (`'static`).
//!
//! ## Synchronous on purpose
//!
//! [`SharedStore`] and [`BroadcastChannel::send`] are plain `fn`s, not
//! `async fn`s. The browser APIs they stand for are synchronous, and the
//! tab coordinator relies on that: an election step either happened or
//! did not, with no await point in the middle where a `select!` could
//! cancel it. Only receiving is asynchronous, through
//! [`BroadcastReceiver::recv`].
//!
//! # Feature Flags
//!
//! - `memory` (default) — an in-process implementation ([`MemoryOrigin`])
//!   where several "tabs" share one store and one broadcast bus.

mod clock;
mod error;
#[cfg(feature = "memory")]
mod memory;

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::PlatformError;
#[cfg(feature = "memory")]
pub use memory::{MemoryBus, MemoryChannel, MemoryOrigin, MemoryStore, MemoryTab};

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use url::Url;

/// Key/value storage shared by every tab of the same origin.
///
/// Mirrors `localStorage`: synchronous, string-valued, last write wins.
/// There is no compare-and-swap; callers that need coordination must
/// build it on top (see the leadership lease in `gwsession-tabs`).
pub trait SharedStore: Send + Sync + 'static {
    /// Reads a value. `Ok(None)` means the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>, PlatformError>;

    /// Writes a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError>;

    /// Deletes a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), PlatformError>;
}

/// A same-origin broadcast channel.
///
/// Like the browser's `BroadcastChannel`, a message sent from one endpoint
/// is delivered to every *other* subscribed endpoint, never back to the
/// sender.
pub trait BroadcastChannel: Send + Sync + 'static {
    /// Sends `data` to every other endpoint.
    fn send(&self, data: &[u8]) -> Result<(), PlatformError>;

    /// Subscribes this endpoint. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> Result<BroadcastReceiver, PlatformError>;
}

/// Receiving half of a broadcast subscription.
#[derive(Debug)]
pub struct BroadcastReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl BroadcastReceiver {
    /// Wraps a raw channel receiver. Used by [`BroadcastChannel`] impls.
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Waits for the next message. Returns `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Document visibility, as reported by `document.visibilityState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visible => write!(f, "visible"),
            Self::Hidden => write!(f, "hidden"),
        }
    }
}

/// Everything the session engine needs from its host environment.
///
/// Cheap to clone: all parts are reference counted.
#[derive(Clone)]
pub struct Platform {
    clock: Arc<dyn Clock>,
    store: Arc<dyn SharedStore>,
    channel: Option<Arc<dyn BroadcastChannel>>,
    visibility: watch::Receiver<Visibility>,
    location: Url,
}

impl Platform {
    /// Creates a platform with no broadcast channel and an always-visible
    /// document. Use the `with_*` methods to fill in the rest.
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn SharedStore>,
        location: Url,
    ) -> Self {
        // The sender is dropped immediately, so `changed()` reports a closed
        // channel. Consumers treat a closed visibility source as "never changes".
        let (_tx, visibility) = watch::channel(Visibility::Visible);
        Self {
            clock,
            store,
            channel: None,
            visibility,
            location,
        }
    }

    /// Attaches a broadcast channel.
    pub fn with_channel(mut self, channel: Arc<dyn BroadcastChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Attaches a visibility source.
    pub fn with_visibility(mut self, visibility: watch::Receiver<Visibility>) -> Self {
        self.visibility = visibility;
        self
    }

    /// Replaces the page location.
    pub fn with_location(mut self, location: Url) -> Self {
        self.location = location;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// The broadcast channel, or `None` when the host has no cross-tab
    /// messaging (the engine then runs in single-tab mode).
    pub fn channel(&self) -> Option<&Arc<dyn BroadcastChannel>> {
        self.channel.as_ref()
    }

    /// A fresh subscription to visibility changes.
    pub fn visibility(&self) -> watch::Receiver<Visibility> {
        self.visibility.clone()
    }

    /// The URL the page was loaded with.
    pub fn location(&self) -> &Url {
        &self.location
    }

    /// Reads a query parameter from the page URL.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.location
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("location", &self.location.as_str())
            .field("has_channel", &self.channel.is_some())
            .field("visibility", &*self.visibility.borrow())
            .finish()
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;

    fn platform(url: &str) -> Platform {
        Platform::new(
            Arc::new(SystemClock),
            Arc::new(MemoryStore::default()),
            Url::parse(url).unwrap(),
        )
    }

    #[test]
    fn test_query_param_returns_decoded_value() {
        let p = platform("https://app.example.com/?gwSession=a.b%2Bc&x=1");
        assert_eq!(p.query_param("gwSession").as_deref(), Some("a.b+c"));
        assert_eq!(p.query_param("x").as_deref(), Some("1"));
    }

    #[test]
    fn test_query_param_missing_returns_none() {
        let p = platform("https://app.example.com/dashboard");
        assert!(p.query_param("gwSession").is_none());
    }

    #[test]
    fn test_new_platform_has_no_channel_and_is_visible() {
        let p = platform("https://app.example.com/");
        assert!(p.channel().is_none());
        assert_eq!(*p.visibility().borrow(), Visibility::Visible);
    }

    #[test]
    fn test_visibility_display() {
        assert_eq!(Visibility::Visible.to_string(), "visible");
        assert_eq!(Visibility::Hidden.to_string(), "hidden");
    }
}
