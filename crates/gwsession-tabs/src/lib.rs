//! Cross-tab coordination for gwsession.
//!
//! Every tab that has the same session open runs one [`TabCoordinator`].
//! Exactly one of them should be the leader: it talks to the backend and
//! broadcasts the authoritative remaining time. Leadership is a TTL lease
//! in the shared store, not consensus. Two tabs may both believe they lead
//! for a moment; the loser steps down as soon as it sees the other's
//! announcement.
//!
//! # Key types
//!
//! - [`TabCoordinator`] — election, lease renewal, broadcast, receive loop
//! - [`CoordinatorEvent`] — what the coordinator reports to its owner
//! - [`LeaseStore`] — read/write/release of the lease record
//! - [`TabConfig`] / [`TabRole`] — settings and the tab's current role

mod config;
mod coordinator;
mod error;
mod lease;

pub use config::{TabConfig, TabRole};
pub use coordinator::{CoordinatorEvent, TabCoordinator, random_tab_id};
pub use error::CoordinatorError;
pub use lease::LeaseStore;
