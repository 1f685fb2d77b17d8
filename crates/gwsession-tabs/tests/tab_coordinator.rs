//! Several coordinators sharing one in-memory origin, with Tokio time
//! paused so leases expire on demand.

use std::sync::Arc;
use std::time::Duration;

use gwsession_platform::{
    BroadcastChannel, Clock, MemoryOrigin, MemoryTab, Platform, PlatformError, SharedStore,
    TokioClock,
};
use gwsession_protocol::{EndReason, Lease, SessionId, TabId, TabMessage};
use gwsession_tabs::{CoordinatorEvent, LeaseStore, TabConfig, TabCoordinator, TabRole};
use tokio::time::{self, Instant};
use url::Url;

const T0_MS: u64 = 1_700_000_000_000;
const LEASE_KEY: &str = "gwsession:s1:leader";

// =========================================================================
// Helpers
// =========================================================================

fn origin() -> MemoryOrigin {
    MemoryOrigin::new(Arc::new(TokioClock::new(T0_MS)))
}

fn open(origin: &MemoryOrigin) -> MemoryTab {
    origin.open_tab(Url::parse("https://app.example.com/?gwSession=tok").unwrap())
}

fn coordinator(tab: &MemoryTab, session: &str, tab_id: &str) -> TabCoordinator {
    TabCoordinator::new(
        TabConfig::default(),
        SessionId::from(session),
        TabId::from(tab_id),
        &tab.platform(),
    )
}

fn stored_lease(origin: &MemoryOrigin) -> Option<Lease> {
    LeaseStore::new(origin.store().clone(), "gwsession", &SessionId::from("s1"))
        .read()
        .unwrap()
}

/// Two started coordinators for session `s1`: `a` leads, `b` follows.
async fn leader_and_follower(
    origin: &MemoryOrigin,
) -> (MemoryTab, TabCoordinator, MemoryTab, TabCoordinator) {
    let tab_a = open(origin);
    let tab_b = open(origin);
    let mut a = coordinator(&tab_a, "s1", "a");
    let mut b = coordinator(&tab_b, "s1", "b");
    assert_eq!(a.start().await, TabRole::Leader);
    assert_eq!(b.start().await, TabRole::Follower);
    (tab_a, a, tab_b, b)
}

struct BrokenStore;

impl SharedStore for BrokenStore {
    fn get(&self, _key: &str) -> Result<Option<String>, PlatformError> {
        Err(PlatformError::StoreUnavailable("quota exceeded".into()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), PlatformError> {
        Err(PlatformError::StoreUnavailable("quota exceeded".into()))
    }

    fn remove(&self, _key: &str) -> Result<(), PlatformError> {
        Err(PlatformError::StoreUnavailable("quota exceeded".into()))
    }
}

// =========================================================================
// start()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_start_first_tab_leads_and_writes_lease() {
    let origin = origin();
    let tab = open(&origin);
    let mut a = coordinator(&tab, "s1", "a");

    let role = a.start().await;

    assert_eq!(role, TabRole::Leader);
    let lease = stored_lease(&origin).expect("lease written");
    assert_eq!(lease.tab_id, TabId::from("a"));
    assert_eq!(lease.lease_expires_at, T0_MS + 60_000);
    assert_eq!(a.lease_expires_at(), Some(T0_MS + 60_000));
    assert!(origin.store().get(LEASE_KEY).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_start_second_tab_follows() {
    let origin = origin();

    let (_ta, a, _tb, b) = leader_and_follower(&origin).await;

    assert_eq!(a.role(), TabRole::Leader);
    assert_eq!(b.role(), TabRole::Follower);
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("a"));
}

#[tokio::test(start_paused = true)]
async fn test_start_takes_over_expired_lease() {
    let origin = origin();
    LeaseStore::new(origin.store().clone(), "gwsession", &SessionId::from("s1"))
        .write(&Lease {
            tab_id: TabId::from("ghost"),
            lease_expires_at: T0_MS - 1,
            written_at: T0_MS - 60_001,
        })
        .unwrap();
    let tab = open(&origin);
    let mut a = coordinator(&tab, "s1", "a");

    let role = a.start().await;

    assert_eq!(role, TabRole::Leader);
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("a"));
}

#[tokio::test(start_paused = true)]
async fn test_start_without_channel_runs_single_tab() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(T0_MS));
    let origin = MemoryOrigin::new(clock.clone());
    let platform = Platform::new(
        clock,
        origin.store().clone(),
        Url::parse("https://app.example.com/").unwrap(),
    );
    let mut a = TabCoordinator::new(
        TabConfig::default(),
        SessionId::from("s1"),
        TabId::from("a"),
        &platform,
    );

    let role = a.start().await;

    assert_eq!(role, TabRole::Leader);
    assert!(a.is_single_tab());
    assert!(origin.store().is_empty(), "single tab keeps no lease");
}

#[tokio::test(start_paused = true)]
async fn test_start_with_broken_store_runs_single_tab() {
    let origin = origin();
    let platform = Platform::new(
        origin.clock().clone(),
        Arc::new(BrokenStore),
        Url::parse("https://app.example.com/").unwrap(),
    )
    .with_channel(Arc::new(origin.bus().endpoint()));
    let mut a = TabCoordinator::new(
        TabConfig::default(),
        SessionId::from("s1"),
        TabId::from("a"),
        &platform,
    );

    let role = a.start().await;

    assert_eq!(role, TabRole::Leader);
    assert!(a.is_single_tab());
}

// =========================================================================
// broadcast() / next_event()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_time_sync_is_compensated_for_transit() {
    let origin = origin();
    let (_ta, mut a, _tb, mut b) = leader_and_follower(&origin).await;

    a.broadcast(TabMessage::TimeSync {
        remaining_seconds: 120,
    })
    .unwrap();
    time::advance(Duration::from_secs(3)).await;
    let event = b.next_event().await;

    assert_eq!(
        event,
        CoordinatorEvent::Message {
            from: TabId::from("a"),
            message: TabMessage::TimeSync {
                remaining_seconds: 117
            },
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_messages_reach_every_other_tab() {
    let origin = origin();
    let (_ta, mut a, _tb, mut b) = leader_and_follower(&origin).await;
    let tab_c = open(&origin);
    let mut c = coordinator(&tab_c, "s1", "c");
    c.start().await;

    b.broadcast(TabMessage::SessionEnded {
        reason: EndReason::Manual,
    })
    .unwrap();

    let expected = CoordinatorEvent::Message {
        from: TabId::from("b"),
        message: TabMessage::SessionEnded {
            reason: EndReason::Manual,
        },
    };
    assert_eq!(a.next_event().await, expected);
    assert_eq!(c.next_event().await, expected);
}

#[tokio::test(start_paused = true)]
async fn test_other_session_messages_are_ignored() {
    let origin = origin();
    let (_ta, _a, _tb, mut b) = leader_and_follower(&origin).await;
    let tab_x = open(&origin);
    let mut x = coordinator(&tab_x, "s2", "x");
    x.start().await;

    x.broadcast(TabMessage::SessionExtended {
        new_expires_at: 1_700_009_999,
    })
    .unwrap();
    let result = time::timeout(Duration::from_secs(1), b.next_event()).await;

    assert!(result.is_err(), "expected no event, got {result:?}");
}

#[tokio::test(start_paused = true)]
async fn test_garbage_on_the_channel_is_skipped() {
    let origin = origin();
    let (_ta, mut a, _tb, mut b) = leader_and_follower(&origin).await;

    origin.bus().endpoint().send(b"{\"type\":").unwrap();
    a.broadcast(TabMessage::SessionExtended {
        new_expires_at: 1_700_007_200,
    })
    .unwrap();

    assert_eq!(
        b.next_event().await,
        CoordinatorEvent::Message {
            from: TabId::from("a"),
            message: TabMessage::SessionExtended {
                new_expires_at: 1_700_007_200
            },
        }
    );
}

// =========================================================================
// Leader maintenance
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_leader_renews_lease_each_interval() {
    let origin = origin();
    let (_ta, mut a, _tb, _b) = leader_and_follower(&origin).await;
    let start = Instant::now();

    let event = a.next_event().await;

    assert_eq!(event, CoordinatorEvent::SyncDue);
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    let renewed = T0_MS + 30_000 + 60_000;
    assert!(a.lease_expires_at().unwrap() >= renewed);
    assert_eq!(stored_lease(&origin).unwrap().lease_expires_at, a.lease_expires_at().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_dual_leaders_resolve_to_lease_holder() {
    let origin = origin();
    let tab_a = open(&origin);
    let tab_b = open(&origin);
    let mut a = coordinator(&tab_a, "s1", "a");
    let mut b = coordinator(&tab_b, "s1", "b");
    a.start().await;
    // b's write lands last, as if both had seen an empty store.
    LeaseStore::new(origin.store().clone(), "gwsession", &SessionId::from("s1"))
        .write(&Lease {
            tab_id: TabId::from("b"),
            lease_expires_at: T0_MS + 60_000,
            written_at: T0_MS,
        })
        .unwrap();

    assert_eq!(b.start().await, TabRole::Leader);
    let event = a.next_event().await;

    assert_eq!(event, CoordinatorEvent::RoleChanged(TabRole::Follower));
    assert_eq!(a.role(), TabRole::Follower);
    assert_eq!(b.role(), TabRole::Leader);
}

// =========================================================================
// Failover
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_released_lease_fails_over_within_one_interval() {
    let origin = origin();
    let (_ta, mut a, _tb, mut b) = leader_and_follower(&origin).await;
    let start = Instant::now();

    assert!(a.shutdown());
    let event = b.next_event().await;

    assert_eq!(event, CoordinatorEvent::RoleChanged(TabRole::Leader));
    assert!(start.elapsed() <= Duration::from_secs(30) + Duration::from_millis(50));
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("b"));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_leader_fails_over_within_two_intervals() {
    let origin = origin();
    let (_ta, a, _tb, mut b) = leader_and_follower(&origin).await;
    let start = Instant::now();

    drop(a);
    let event = b.next_event().await;

    assert_eq!(event, CoordinatorEvent::RoleChanged(TabRole::Leader));
    assert!(start.elapsed() <= Duration::from_secs(45) + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_late_follower_takes_over_before_crashed_lease_expires() {
    let origin = origin();
    let tab_a = open(&origin);
    let mut a = coordinator(&tab_a, "s1", "a");
    a.start().await;
    time::sleep(Duration::from_secs(29)).await;
    let tab_b = open(&origin);
    let mut b = coordinator(&tab_b, "s1", "b");
    assert_eq!(b.start().await, TabRole::Follower);
    // Renewals at 30s and 60s, then the leader's tab dies.
    assert_eq!(a.next_event().await, CoordinatorEvent::SyncDue);
    assert_eq!(a.next_event().await, CoordinatorEvent::SyncDue);
    let crashed_at = Instant::now();
    let lease_expires_at = a.lease_expires_at().unwrap();

    drop(a);
    let event = b.next_event().await;

    assert_eq!(event, CoordinatorEvent::RoleChanged(TabRole::Leader));
    let took = crashed_at.elapsed();
    assert!(took <= Duration::from_secs(60), "failover took {took:?}");
    assert!(origin.clock().now_ms() < lease_expires_at);
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("b"));
}

#[tokio::test(start_paused = true)]
async fn test_follower_keeps_following_a_live_leader() {
    let origin = origin();
    let (_ta, mut a, _tb, mut b) = leader_and_follower(&origin).await;

    let leader = async {
        loop {
            assert_eq!(a.next_event().await, CoordinatorEvent::SyncDue);
        }
    };
    let follower = time::timeout(Duration::from_secs(300), b.next_event());
    let result = tokio::select! {
        result = follower => result,
        _ = leader => unreachable!(),
    };

    assert!(result.is_err(), "follower changed role: {result:?}");
    assert_eq!(b.role(), TabRole::Follower);
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("a"));
}

#[tokio::test(start_paused = true)]
async fn test_closed_bus_makes_follower_lead_alone() {
    let origin = origin();
    let (_ta, _a, _tb, mut b) = leader_and_follower(&origin).await;

    origin.bus().close();
    let event = b.next_event().await;

    assert_eq!(event, CoordinatorEvent::RoleChanged(TabRole::Leader));
    assert!(b.is_single_tab());
}

#[tokio::test(start_paused = true)]
async fn test_failed_broadcast_degrades_to_single_tab() {
    let origin = origin();
    let (_ta, _a, _tb, mut b) = leader_and_follower(&origin).await;
    origin.bus().close();

    let result = b.broadcast(TabMessage::TimeSync {
        remaining_seconds: 10,
    });

    assert!(result.is_err());
    assert!(b.is_single_tab());
    assert_eq!(b.role(), TabRole::Leader);
}

// =========================================================================
// shutdown()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_new_leaders_lease_alone() {
    let origin = origin();
    let (_ta, mut a, _tb, _b) = leader_and_follower(&origin).await;
    LeaseStore::new(origin.store().clone(), "gwsession", &SessionId::from("s1"))
        .write(&Lease {
            tab_id: TabId::from("b"),
            lease_expires_at: T0_MS + 60_000,
            written_at: T0_MS,
        })
        .unwrap();

    let released = a.shutdown();

    assert!(!released);
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("b"));
}

#[tokio::test(start_paused = true)]
async fn test_follower_shutdown_releases_nothing() {
    let origin = origin();
    let (_ta, _a, _tb, mut b) = leader_and_follower(&origin).await;

    assert!(!b.shutdown());
    assert_eq!(stored_lease(&origin).unwrap().tab_id, TabId::from("a"));
}
