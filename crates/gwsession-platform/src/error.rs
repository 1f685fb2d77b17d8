/// Errors that can occur in the platform adapter.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The cross-tab store could not be read or written.
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// The broadcast channel is not supported or has been closed.
    #[error("broadcast channel unavailable: {0}")]
    BroadcastUnavailable(String),
}
