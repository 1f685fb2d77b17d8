//! Session events and the observer registry.
//!
//! Observers are plain callbacks registered on the orchestrator. Each
//! registration returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the callback. Callbacks run on
//! the session's actor task, in the order events happen, so they must not
//! block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use gwsession_protocol::{EndReason, SessionRecord};
use gwsession_tabs::TabRole;
use parking_lot::Mutex;

use crate::ErrorKind;

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The token was accepted and the countdown is set up.
    Started { record: SessionRecord, role: TabRole },

    /// Emitted every second while the countdown runs.
    Tick { remaining_seconds: u64 },

    /// The warning threshold was reached. Emitted after the
    /// `on_session_warning` hook ran.
    Warning { remaining_seconds: u64 },

    /// The session's expiry moved (here or in another tab).
    Extended { new_expires_at: u64 },

    /// This tab became leader or follower.
    RoleChanged { role: TabRole },

    /// The session is over.
    Ended { reason: EndReason },

    /// Something failed. Fatal during initialization, informational after.
    Error { kind: ErrorKind, message: String },

    /// The host should navigate to `url` (the marketplace).
    Redirect { url: String },
}

type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// The callbacks registered on one orchestrator.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback)>>,
}

impl Observers {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            observers: Arc::downgrade(self),
        }
    }

    /// Calls every callback with `event`.
    ///
    /// The list is copied first, so a callback may subscribe or
    /// unsubscribe without deadlocking.
    pub(crate) fn emit(&self, event: &SessionEvent) {
        let callbacks: Vec<Callback> = self
            .entries
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }
}

/// Keeps a callback registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
}

impl Subscription {
    /// Removes the callback now.
    pub fn unsubscribe(self) {}

    /// Keeps the callback for as long as the orchestrator lives.
    pub fn forget(mut self) {
        self.observers = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(observers: &Arc<Observers>) -> (Arc<AtomicU64>, Subscription) {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let sub = observers.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    fn tick() -> SessionEvent {
        SessionEvent::Tick {
            remaining_seconds: 10,
        }
    }

    #[test]
    fn test_emit_reaches_every_observer() {
        let observers = Arc::new(Observers::default());
        let (a, _sa) = counter(&observers);
        let (b, _sb) = counter(&observers);

        observers.emit(&tick());

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let observers = Arc::new(Observers::default());
        let (count, sub) = counter(&observers);

        drop(sub);
        observers.emit(&tick());

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(observers.len(), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_callback() {
        let observers = Arc::new(Observers::default());
        let (a, sa) = counter(&observers);
        let (b, _sb) = counter(&observers);

        sa.unsubscribe();
        observers.emit(&tick());

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forget_keeps_callback() {
        let observers = Arc::new(Observers::default());
        let (count, sub) = counter(&observers);

        sub.forget();
        observers.emit(&tick());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_unsubscribe_during_emit() {
        let observers = Arc::new(Observers::default());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let sub = observers.subscribe(move |_| {
            inner.lock().take();
        });
        *slot.lock() = Some(sub);

        observers.emit(&tick());

        assert_eq!(observers.len(), 0);
    }

    #[test]
    fn test_subscription_outliving_registry_is_harmless() {
        let observers = Arc::new(Observers::default());
        let (_count, sub) = counter(&observers);

        drop(observers);
        drop(sub);
    }
}
