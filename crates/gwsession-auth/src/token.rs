//! Offline JWT parsing.
//!
//! [`parse`] splits a compact JWT into its three segments and decodes the
//! header and claims. It never looks at key material or the network, so it
//! is the cheap first gate every inbound token passes through.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use gwsession_protocol::SessionClaims;
use serde::Deserialize;

use crate::AuthError;

/// The JOSE header fields the validator looks at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub typ: Option<String>,
}

/// A structurally valid, not yet verified token.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub header: TokenHeader,
    pub claims: SessionClaims,
    signing_input: String,
    signature: String,
}

impl ParsedToken {
    /// `header.payload`, the bytes the signature covers.
    pub fn signing_input(&self) -> &str {
        &self.signing_input
    }

    /// The signature segment, still base64url encoded.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// Parses a compact JWT.
///
/// # Errors
/// [`AuthError::Malformed`] unless the token has exactly three segments,
/// the header and payload segments are base64url (no padding) and decode
/// to JSON objects carrying the expected fields.
///
/// The signature segment is only checked for presence here. Whether its
/// bytes decode is a question for signature verification, so a tampered
/// signature surfaces as [`AuthError::SignatureInvalid`], never as a
/// malformed token.
pub fn parse(token: &str) -> Result<ParsedToken, AuthError> {
    let token = token.trim();
    let segments: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature] = segments.as_slice() else {
        return Err(AuthError::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    };

    let header: TokenHeader = decode_segment(header_b64, "header")?;
    let claims: SessionClaims = decode_segment(payload_b64, "payload")?;

    Ok(ParsedToken {
        header,
        claims,
        signing_input: format!("{header_b64}.{payload_b64}"),
        signature: (*signature).to_string(),
    })
}

fn decode_segment<T: for<'de> Deserialize<'de>>(
    segment: &str,
    name: &str,
) -> Result<T, AuthError> {
    if segment.is_empty() {
        return Err(AuthError::Malformed(format!("{name} segment is empty")));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(format!("{name} is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Malformed(format!("{name} is not a valid JSON object: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(json: &str) -> String {
        URL_SAFE_NO_PAD.encode(json)
    }

    fn header() -> String {
        b64(r#"{"alg":"RS256","typ":"JWT","kid":"k1"}"#)
    }

    fn payload() -> String {
        b64(r#"{"session_id":"s1","app_id":"a","user_id":"u","org_id":"o","iat":100,"exp":200}"#)
    }

    // =====================================================================
    // parse()
    // =====================================================================

    #[test]
    fn test_parse_well_formed_token_extracts_header_and_claims() {
        let token = format!("{}.{}.c2ln", header(), payload());

        let parsed = parse(&token).expect("should parse");

        assert_eq!(parsed.header.alg, "RS256");
        assert_eq!(parsed.header.kid.as_deref(), Some("k1"));
        assert_eq!(parsed.claims.session_id, "s1");
        assert_eq!(parsed.claims.exp, 200);
        assert_eq!(parsed.signing_input(), format!("{}.{}", header(), payload()));
        assert_eq!(parsed.signature(), "c2ln");
    }

    #[test]
    fn test_parse_two_segments_is_malformed() {
        let token = format!("{}.{}", header(), payload());

        let result = parse(&token);

        assert!(
            matches!(result, Err(AuthError::Malformed(ref m)) if m.contains("found 2")),
            "got {result:?}"
        );
    }

    #[test]
    fn test_parse_four_segments_is_malformed() {
        let token = format!("{}.{}.sig.extra", header(), payload());
        assert!(matches!(parse(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_parse_non_base64_header_is_malformed() {
        let token = format!("!!!.{}.sig", payload());
        assert!(matches!(parse(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_parse_payload_missing_exp_is_malformed() {
        let token = format!("{}.{}.sig", header(), b64(r#"{"session_id":"s","iat":1}"#));
        assert!(matches!(parse(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_parse_header_without_alg_is_malformed() {
        let token = format!("{}.{}.sig", b64(r#"{"typ":"JWT"}"#), payload());
        assert!(matches!(parse(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_parse_empty_string_is_malformed() {
        assert!(matches!(parse(""), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_parse_garbage_signature_still_parses() {
        // Signature bytes are judged by verification, not by the parser.
        let token = format!("{}.{}.not*base64", header(), payload());
        assert!(parse(&token).is_ok());
    }
}
