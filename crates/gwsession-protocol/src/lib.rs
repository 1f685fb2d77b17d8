//! Wire types for gwsession.
//!
//! - **Types** ([`SessionRecord`], [`TabEnvelope`], [`Lease`], …) — the
//!   session as every tab sees it and what tabs tell each other.
//! - **API** ([`Jwks`], [`HeartbeatResponse`], …) — bodies of the
//!   marketplace session API.
//! - **Codec** ([`Codec`], [`JsonCodec`]) — bytes in, bytes out.
//!
//! This crate knows nothing about timers, tabs or HTTP. It only knows the
//! shape of the data.

mod api;
mod codec;
mod error;
mod timestamp;
mod types;

pub use api::{
    BackendSession, CompleteRequest, CompleteResponse, HeartbeatRequest, HeartbeatResponse,
    Jwk, Jwks, RenewRequest, RenewResponse, SessionStatus, ValidateRequest, ValidateResponse,
};
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use timestamp::parse_timestamp;
pub use types::{
    EndReason, Lease, SessionClaims, SessionId, SessionRecord, TabEnvelope, TabId, TabMessage,
};
