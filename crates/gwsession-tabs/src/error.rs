//! Error types for the coordination layer.

use gwsession_platform::PlatformError;
use gwsession_protocol::ProtocolError;

/// Errors that can occur while coordinating tabs.
///
/// None of these are fatal to a session: the coordinator falls back to
/// single-tab mode and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The shared store could not be read or written.
    #[error("lease store: {0}")]
    Store(#[source] PlatformError),

    /// The broadcast channel rejected a message or is gone.
    #[error("broadcast: {0}")]
    Broadcast(#[source] PlatformError),

    /// A message or lease could not be encoded.
    #[error(transparent)]
    Codec(#[from] ProtocolError),
}
