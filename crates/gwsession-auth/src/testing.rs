//! A fixed RSA key pair for signing test tokens.
//!
//! Available in this crate's own tests and, for other crates, behind the
//! `test-util` feature. The private key lives in `tests/fixtures/`; its
//! public half is published by [`TestSigner::jwks`].

use gwsession_protocol::{Jwk, Jwks, SessionClaims};
use jsonwebtoken::{Algorithm, EncodingKey, Header};

/// `kid` the test key is published under.
pub const TEST_KID: &str = "gwsession-test-1";

const SIGNING_KEY_PEM: &str = include_str!("../tests/fixtures/signing_key.pem");
const ROGUE_KEY_PEM: &str = include_str!("../tests/fixtures/rogue_key.pem");

const MODULUS: &str = "zzjGR90ZuMo_YyllSZ-azLw-tKRmsBdh4IFtyv_6juaUm6DD2UwzCiEM-Qx-uAOb0WXmRC5JsG2VwiX6bVN13RosCcc81PD1ZbO8mV1XQg0_6Vh82TT2fW5CaMSylWxXPmCmlE18QyAv_jwdirUaAI6WX7YiZTsCW2UE5RdGCAjrMpbrCgXoCxzh-sqbzYE45wRe9rUtijq6kdGsqeFPP3r5617nagd946nuOL7mtpASbATYJgLSrp0xldIRdEP9MK5zpYTggaHwEBxTJ6DBz3PF6XjK3iCJVlp_7dF3nNCWoWQ6FZouYkrAp6Smo5z9Cll1q7oXn9uXCN66u_Zitw";
const EXPONENT: &str = "AQAB";

/// Signs session tokens with RS256.
pub struct TestSigner {
    key: EncodingKey,
    kid: Option<String>,
}

impl TestSigner {
    /// The key whose public half is in [`TestSigner::jwks`].
    pub fn new() -> Self {
        Self::from_pem(SIGNING_KEY_PEM)
    }

    /// A different key that claims the same `kid`, for forged tokens.
    pub fn rogue() -> Self {
        Self::from_pem(ROGUE_KEY_PEM)
    }

    fn from_pem(pem: &str) -> Self {
        let key = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("fixture key is a valid RSA PEM");
        Self {
            key,
            kid: Some(TEST_KID.to_string()),
        }
    }

    /// Replaces the `kid` written into token headers.
    pub fn with_kid(mut self, kid: Option<&str>) -> Self {
        self.kid = kid.map(str::to_string);
        self
    }

    /// A compact RS256 JWT carrying `claims`.
    pub fn sign(&self, claims: &SessionClaims) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.kid.clone();
        jsonwebtoken::encode(&header, claims, &self.key).expect("RS256 signing with a fixture key")
    }

    /// The public key as a JWK.
    pub fn jwk() -> Jwk {
        Jwk {
            kty: "RSA".into(),
            use_: Some("sig".into()),
            kid: Some(TEST_KID.into()),
            alg: Some("RS256".into()),
            n: Some(MODULUS.into()),
            e: Some(EXPONENT.into()),
        }
    }

    /// A key set holding only [`TestSigner::jwk`].
    pub fn jwks() -> Jwks {
        Jwks {
            keys: vec![Self::jwk()],
        }
    }
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::new()
    }
}

/// Claims for a session issued at `iat` that lasts until `exp`.
pub fn claims(session_id: &str, iat: u64, exp: u64) -> SessionClaims {
    SessionClaims {
        session_id: session_id.to_string(),
        app_id: "app-1".into(),
        user_id: "user-1".into(),
        org_id: "org-1".into(),
        duration_minutes: None,
        iss: "https://api.example.com".into(),
        sub: "user-1".into(),
        iat,
        exp,
    }
}
