//! The leadership lease in the shared store.

use std::sync::Arc;

use gwsession_platform::SharedStore;
use gwsession_protocol::{Codec, JsonCodec, Lease, SessionId, TabId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::CoordinatorError;

/// Reads and writes one session's lease record.
///
/// Cheap to clone. The orchestrator keeps a clone so it can release the
/// lease synchronously from `Drop`, without going through the actor.
///
/// Clones share a closed flag. After [`close`](Self::close) returns no
/// clone writes again, so a coordinator still winding down on another
/// thread cannot bring back a lease its owner already released.
#[derive(Clone)]
pub struct LeaseStore {
    store: Arc<dyn SharedStore>,
    key: String,
    codec: JsonCodec,
    /// Held for the whole of a write, so `close()` waits out one in flight.
    closed: Arc<Mutex<bool>>,
}

impl LeaseStore {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: &str, session_id: &SessionId) -> Self {
        Self {
            store,
            key: format!("{key_prefix}:{session_id}:leader"),
            codec: JsonCodec,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// The store key, `{prefix}:{session_id}:leader`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current lease, if any.
    ///
    /// A record that doesn't decode (written by an older build, or
    /// corrupted by hand) counts as no lease at all.
    pub fn read(&self) -> Result<Option<Lease>, CoordinatorError> {
        let Some(raw) = self.store.get(&self.key).map_err(CoordinatorError::Store)? else {
            return Ok(None);
        };
        match self.codec.decode::<Lease>(raw.as_bytes()) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                warn!(key = %self.key, error = %e, "ignoring undecodable lease");
                Ok(None)
            }
        }
    }

    /// Stores `lease`. A no-op once the store is closed.
    pub fn write(&self, lease: &Lease) -> Result<(), CoordinatorError> {
        let closed = self.closed.lock();
        if *closed {
            debug!(key = %self.key, tab_id = %lease.tab_id, "lease store closed, write dropped");
            return Ok(());
        }
        let bytes = self.codec.encode(lease)?;
        let value = String::from_utf8_lossy(&bytes);
        self.store
            .set(&self.key, &value)
            .map_err(CoordinatorError::Store)
    }

    /// Stops every clone of this store from writing. Reads and
    /// [`release_if_held`](Self::release_if_held) keep working.
    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Removes the lease if `tab_id` still holds it. Returns whether a
    /// lease was removed.
    ///
    /// Never removes another tab's lease: after a handover, the old
    /// leader's teardown must not evict the new one.
    pub fn release_if_held(&self, tab_id: &TabId) -> Result<bool, CoordinatorError> {
        match self.read()? {
            Some(lease) if lease.is_held_by(tab_id) => {
                self.store
                    .remove(&self.key)
                    .map_err(CoordinatorError::Store)?;
                debug!(key = %self.key, %tab_id, "lease released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl std::fmt::Debug for LeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseStore")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwsession_platform::MemoryStore;

    fn lease_store() -> (Arc<MemoryStore>, LeaseStore) {
        let store = Arc::new(MemoryStore::new());
        let leases = LeaseStore::new(store.clone(), "gwsession", &SessionId::from("s1"));
        (store, leases)
    }

    fn lease(tab: &str, expires_at: u64) -> Lease {
        Lease {
            tab_id: TabId::from(tab),
            lease_expires_at: expires_at,
            written_at: 1_000,
        }
    }

    // ===== key() =====

    #[test]
    fn test_key_includes_session_id() {
        let (_store, leases) = lease_store();
        assert_eq!(leases.key(), "gwsession:s1:leader");
    }

    // ===== read() / write() =====

    #[test]
    fn test_read_empty_store_returns_none() {
        let (_store, leases) = lease_store();
        assert_eq!(leases.read().unwrap(), None);
    }

    #[test]
    fn test_write_then_read_returns_lease() {
        let (_store, leases) = lease_store();

        leases.write(&lease("a", 61_000)).unwrap();

        assert_eq!(leases.read().unwrap(), Some(lease("a", 61_000)));
    }

    #[test]
    fn test_read_garbage_returns_none() {
        let (store, leases) = lease_store();
        store.set("gwsession:s1:leader", "{not json").unwrap();

        assert_eq!(leases.read().unwrap(), None);
    }

    // ===== release_if_held() =====

    #[test]
    fn test_release_if_held_removes_own_lease() {
        let (store, leases) = lease_store();
        leases.write(&lease("a", 61_000)).unwrap();

        let released = leases.release_if_held(&TabId::from("a")).unwrap();

        assert!(released);
        assert!(store.is_empty());
    }

    #[test]
    fn test_release_if_held_keeps_other_tabs_lease() {
        let (_store, leases) = lease_store();
        leases.write(&lease("b", 61_000)).unwrap();

        let released = leases.release_if_held(&TabId::from("a")).unwrap();

        assert!(!released);
        assert_eq!(leases.read().unwrap(), Some(lease("b", 61_000)));
    }

    // ===== close() =====

    #[test]
    fn test_close_stops_writes_from_every_clone() {
        let (store, leases) = lease_store();
        let actor_copy = leases.clone();
        leases.write(&lease("a", 61_000)).unwrap();

        leases.close();
        assert!(leases.release_if_held(&TabId::from("a")).unwrap());
        actor_copy.write(&lease("a", 91_000)).unwrap();

        assert!(actor_copy.is_closed());
        assert!(store.is_empty());
    }

    #[test]
    fn test_close_leaves_other_sessions_writable() {
        let (store, leases) = lease_store();
        let other = LeaseStore::new(store.clone(), "gwsession", &SessionId::from("s2"));

        leases.close();
        other.write(&lease("b", 61_000)).unwrap();

        assert_eq!(other.read().unwrap(), Some(lease("b", 61_000)));
    }

    #[test]
    fn test_release_if_held_without_lease_is_noop() {
        let (_store, leases) = lease_store();
        assert!(!leases.release_if_held(&TabId::from("a")).unwrap());
    }
}
