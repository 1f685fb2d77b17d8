//! Codec trait and the JSON implementation.
//!
//! Tab envelopes and leases cross the broadcast channel and the shared
//! store as bytes. The [`Codec`] trait hides which format is used so the
//! coordinator never calls `serde_json` directly.
//!
//! ## Why a trait for a single format?
//!
//! Everything that leaves a tab goes through one of two byte pipes, the
//! broadcast bus and the shared store. Both sides of each pipe must agree
//! on the format, and the cleanest way to make that agreement visible is
//! a single value, the codec, that the coordinator holds and uses for
//! every read and write. Nothing else in the crate knows the format.
//!
//! That is the "strategy" idea: callers program against the interface
//! and the concrete strategy is picked once, where the coordinator is
//! built. Today there is one strategy, [`JsonCodec`], because JSON is
//! what a browser would write into `localStorage`. A compact binary codec
//! for a native host could slot in later without touching the election
//! or message-handling code.
//!
//! ## Decode failures are data, not bugs
//!
//! Bytes on the bus come from other tabs, possibly running an older build
//! or a different app entirely. A [`ProtocolError::Decode`] is therefore
//! an expected outcome. The coordinator logs it at debug level and skips
//! the message; the lease store treats an undecodable record as "no
//! lease". Neither ever panics on foreign input.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// ## Trait bounds
///
/// - `Send + Sync`: the coordinator lives inside a session actor that
///   Tokio may move between worker threads, and it owns its codec.
/// - `'static`: a codec carries no borrowed data, so it can be stored in
///   a spawned task for as long as the session runs.
///
/// ## Generic methods
///
/// `encode` and `decode` are generic over the value type rather than the
/// trait being generic over it. One codec value serves envelopes, leases
/// and anything else serde can describe. The flip side is that `Codec`
/// is not object safe (`dyn Codec` won't compile), which is fine: it is
/// always used as a concrete type or a type parameter.
///
/// `decode` asks for `DeserializeOwned` instead of `Deserialize<'de>` so
/// the decoded value never borrows from the input buffer. The receive
/// loop reuses or drops that buffer right after decoding.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] backed by `serde_json`.
///
/// JSON is what a browser tab would put in `localStorage` and on a
/// `BroadcastChannel`, so it is the only format gwsession speaks.
///
/// ```rust
/// use gwsession_protocol::{Codec, JsonCodec, TabMessage};
///
/// let codec = JsonCodec;
/// let msg = TabMessage::TimeSync { remaining_seconds: 90 };
///
/// let bytes = codec.encode(&msg).unwrap();
/// let decoded: TabMessage = codec.decode(&bytes).unwrap();
/// assert_eq!(msg, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{Lease, TabId};

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let result: Result<Lease, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_lease_encodes_as_flat_json() {
        let lease = Lease {
            tab_id: TabId::from("tab-1"),
            lease_expires_at: 2_000,
            written_at: 1_000,
        };
        let bytes = JsonCodec.encode(&lease).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["tab_id"], "tab-1");
        assert_eq!(value["lease_expires_at"], 2_000);
    }
}
