//! Session token validation for gwsession.
//!
//! A session starts from a JWT handed over in the page URL. This crate
//! decides whether to believe it:
//!
//! 1. **Parse** ([`parse`]) — three base64url segments, JSON header and
//!    claims. Offline; a two-segment token never reaches the network.
//! 2. **Expiry** — `exp` against the platform clock, always first.
//! 3. **Signature** ([`TokenValidator`]) — RS256 against the published key
//!    set (cached, refreshed once on an unknown `kid`), or delegated to the
//!    backend's `/sessions/validate` when configured.
//! 4. **Issuer** — optional `iss` pinning.
//!
//! The result is a [`SessionRecord`](gwsession_protocol::SessionRecord).
//!
//! # Feature Flags
//!
//! - `test-util` — the [`testing`] module: a fixed RSA key pair that signs
//!   tokens the validator accepts.

mod error;
mod jwks;
mod token;
mod validator;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::AuthError;
pub use jwks::JwksCache;
pub use token::{ParsedToken, TokenHeader, parse};
pub use validator::{TokenValidator, ValidatorConfig};
