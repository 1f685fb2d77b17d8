//! Error types for the protocol layer.

/// Errors that can occur while encoding, decoding or interpreting
/// session data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, wrong types.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The data decoded but breaks a protocol rule, e.g. a token whose
    /// `exp` is not after its `iat`.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A timestamp was neither Unix seconds/milliseconds nor RFC 3339.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
