//! In-process platform: several "tabs" sharing one origin.
//!
//! [`MemoryOrigin`] owns the pieces a browser shares between tabs of the
//! same origin (a clock, `localStorage`, a broadcast bus). Each call to
//! [`MemoryOrigin::open_tab`] yields a [`MemoryTab`] with its own
//! broadcast endpoint and its own visibility switch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use url::Url;

use crate::{
    BroadcastChannel, BroadcastReceiver, Clock, Platform, PlatformError, SharedStore,
    Visibility,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// A `localStorage` stand-in backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PlatformError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PlatformError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

struct Subscriber {
    endpoint: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_endpoint: AtomicU64,
    closed: AtomicBool,
}

/// A broadcast bus shared by every endpoint of one origin.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new endpoint (one per tab).
    pub fn endpoint(&self) -> MemoryChannel {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        MemoryChannel {
            bus: self.clone(),
            endpoint: id,
        }
    }

    /// Makes every endpoint fail from now on, as if the host had no
    /// broadcast support. Existing subscriptions are closed.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut subs = self.inner.subscribers.lock();
        debug!(subscribers = subs.len(), "memory bus closed");
        subs.clear();
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.inner.subscribers.lock();
        subs.retain(|s| !s.sender.is_closed());
        subs.len()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// One tab's view of a [`MemoryBus`].
pub struct MemoryChannel {
    bus: MemoryBus,
    endpoint: u64,
}

impl BroadcastChannel for MemoryChannel {
    fn send(&self, data: &[u8]) -> Result<(), PlatformError> {
        if self.bus.is_closed() {
            trace!(endpoint = self.endpoint, "send on closed memory bus");
            return Err(PlatformError::BroadcastUnavailable("bus closed".into()));
        }
        let mut subs = self.bus.inner.subscribers.lock();
        // Drop subscribers whose receiver is gone while we're here.
        let before = subs.len();
        subs.retain(|s| !s.sender.is_closed());
        if subs.len() < before {
            trace!(
                endpoint = self.endpoint,
                pruned = before - subs.len(),
                "dropped subscribers pruned"
            );
        }
        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.endpoint != self.endpoint) {
            if sub.sender.send(data.to_vec()).is_ok() {
                delivered += 1;
            }
        }
        trace!(endpoint = self.endpoint, bytes = data.len(), delivered, "memory bus send");
        Ok(())
    }

    fn subscribe(&self) -> Result<BroadcastReceiver, PlatformError> {
        if self.bus.is_closed() {
            return Err(PlatformError::BroadcastUnavailable("bus closed".into()));
        }
        let (sender, rx) = mpsc::unbounded_channel();
        self.bus.inner.subscribers.lock().push(Subscriber {
            endpoint: self.endpoint,
            sender,
        });
        Ok(BroadcastReceiver::new(rx))
    }
}

// ---------------------------------------------------------------------------
// MemoryOrigin / MemoryTab
// ---------------------------------------------------------------------------

/// Shared state of one origin: clock, store and broadcast bus.
#[derive(Clone)]
pub struct MemoryOrigin {
    clock: Arc<dyn Clock>,
    store: Arc<MemoryStore>,
    bus: MemoryBus,
}

impl MemoryOrigin {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            store: Arc::new(MemoryStore::new()),
            bus: MemoryBus::new(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Opens a new tab at `location`.
    pub fn open_tab(&self, location: Url) -> MemoryTab {
        let (visibility_tx, visibility_rx) = watch::channel(Visibility::Visible);
        let platform = Platform::new(self.clock.clone(), self.store.clone(), location)
            .with_channel(Arc::new(self.bus.endpoint()))
            .with_visibility(visibility_rx);
        MemoryTab {
            platform,
            visibility: visibility_tx,
        }
    }
}

/// A tab opened on a [`MemoryOrigin`].
pub struct MemoryTab {
    platform: Platform,
    visibility: watch::Sender<Visibility>,
}

impl MemoryTab {
    /// The platform handed to the session engine for this tab.
    pub fn platform(&self) -> Platform {
        self.platform.clone()
    }

    /// Flips the document visibility, notifying subscribers on change.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_if_modified(|current| {
            if *current == visibility {
                false
            } else {
                *current = visibility;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemClock;

    fn origin() -> MemoryOrigin {
        MemoryOrigin::new(Arc::new(SystemClock))
    }

    fn url() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    #[test]
    fn test_memory_store_set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(store.len(), 1);

        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_endpoints_not_sender() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let c = bus.endpoint();
        let mut rx_a = a.subscribe().unwrap();
        let mut rx_b = b.subscribe().unwrap();
        let mut rx_c = c.subscribe().unwrap();

        a.send(b"hello").unwrap();

        assert_eq!(rx_b.recv().await.unwrap(), b"hello");
        assert_eq!(rx_c.recv().await.unwrap(), b"hello");
        // The sender's own subscription stays empty.
        assert!(rx_a.rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let rx = a.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_send_prunes_dropped_subscribers() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let _rx_a = a.subscribe().unwrap();
        let rx_b = b.subscribe().unwrap();
        drop(rx_b);

        a.send(b"ping").unwrap();

        assert_eq!(bus.inner.subscribers.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_existing_subscriptions() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let mut rx = a.subscribe().unwrap();

        bus.close();

        assert_eq!(rx.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_closed_bus_rejects_send_and_subscribe() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        bus.close();

        assert!(matches!(
            a.send(b"x"),
            Err(PlatformError::BroadcastUnavailable(_))
        ));
        assert!(matches!(
            a.subscribe(),
            Err(PlatformError::BroadcastUnavailable(_))
        ));
    }

    #[test]
    fn test_tabs_share_store() {
        let origin = origin();
        let t1 = origin.open_tab(url());
        let t2 = origin.open_tab(url());

        t1.platform().store().set("lease", "t1").unwrap();

        assert_eq!(
            t2.platform().store().get("lease").unwrap().as_deref(),
            Some("t1")
        );
    }

    #[tokio::test]
    async fn test_tab_visibility_change_is_observed() {
        let tab = origin().open_tab(url());
        let mut rx = tab.platform().visibility();

        tab.set_visibility(Visibility::Hidden);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Visibility::Hidden);
    }

    #[test]
    fn test_same_visibility_does_not_notify() {
        let tab = origin().open_tab(url());
        let rx = tab.platform().visibility();

        tab.set_visibility(Visibility::Visible);

        assert!(!rx.has_changed().unwrap());
    }
}
