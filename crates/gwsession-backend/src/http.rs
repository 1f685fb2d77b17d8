//! `reqwest` implementation of [`SessionBackend`].

use std::time::Duration;

use gwsession_protocol::{
    CompleteRequest, CompleteResponse, HeartbeatRequest, HeartbeatResponse, Jwks, RenewRequest,
    RenewResponse, SessionId, ValidateRequest, ValidateResponse,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::{BackendError, SessionBackend};

/// HTTP client for the marketplace session API.
///
/// Cheap to clone (the inner `reqwest::Client` is reference counted).
/// Every request carries the configured timeout, so a hung backend can
/// never hold a caller longer than that.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    api_endpoint: Url,
}

impl HttpBackend {
    /// Creates a client for the API rooted at `api_endpoint`
    /// (e.g. `https://api.example.com/v1`).
    ///
    /// # Errors
    /// [`BackendError::InvalidEndpoint`] if the URL doesn't parse or can't
    /// carry a path; [`BackendError::Network`] if the TLS stack fails to
    /// initialize.
    pub fn new(api_endpoint: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let api_endpoint = Url::parse(api_endpoint)
            .map_err(|e| BackendError::InvalidEndpoint(format!("{api_endpoint}: {e}")))?;
        if api_endpoint.cannot_be_a_base() {
            return Err(BackendError::InvalidEndpoint(api_endpoint.to_string()));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("gwsession/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_endpoint,
        })
    }

    /// The base URL requests are built from.
    pub fn api_endpoint(&self) -> &Url {
        &self.api_endpoint
    }

    /// Appends path segments to the API root. Segments are percent-encoded,
    /// so a session id can't escape its path position.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.api_endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidEndpoint(self.api_endpoint.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), %message, "backend rejected request");
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        response.json::<T>().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else if err.is_decode() {
        BackendError::Decode(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

impl SessionBackend for HttpBackend {
    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<Jwks, BackendError> {
        let url = Url::parse(jwks_uri)
            .map_err(|e| BackendError::InvalidEndpoint(format!("{jwks_uri}: {e}")))?;
        debug!(%url, "fetching JWKS");
        self.send_json(self.client.get(url)).await
    }

    async fn validate(&self, token: &str) -> Result<ValidateResponse, BackendError> {
        let url = self.endpoint(&["sessions", "validate"])?;
        let body = ValidateRequest {
            token: token.to_string(),
        };
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn heartbeat(
        &self,
        session_id: &SessionId,
        token: &str,
        timestamp: Option<u64>,
    ) -> Result<HeartbeatResponse, BackendError> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "heartbeat"])?;
        let body = HeartbeatRequest { timestamp };
        self.send_json(self.client.post(url).bearer_auth(token).json(&body))
            .await
    }

    async fn renew(
        &self,
        session_id: &SessionId,
        token: &str,
        additional_minutes: u64,
    ) -> Result<RenewResponse, BackendError> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "renew"])?;
        let body = RenewRequest { additional_minutes };
        self.send_json(self.client.put(url).bearer_auth(token).json(&body))
            .await
    }

    async fn complete(
        &self,
        session_id: &SessionId,
        token: &str,
        actual_usage_minutes: Option<u64>,
    ) -> Result<CompleteResponse, BackendError> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "complete"])?;
        let body = CompleteRequest {
            actual_usage_minutes,
        };
        self.send_json(self.client.post(url).bearer_auth(token).json(&body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let b = backend("https://api.example.com/v1");
        let url = b.endpoint(&["sessions", "validate"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/sessions/validate");
    }

    #[test]
    fn test_endpoint_handles_trailing_slash() {
        let b = backend("https://api.example.com/v1/");
        let url = b.endpoint(&["sessions", "abc", "heartbeat"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/sessions/abc/heartbeat"
        );
    }

    #[test]
    fn test_endpoint_encodes_session_id() {
        let b = backend("https://api.example.com");
        let url = b.endpoint(&["sessions", "../admin", "renew"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/sessions/..%2Fadmin/renew"
        );
    }

    #[test]
    fn test_new_rejects_non_base_url() {
        assert!(matches!(
            HttpBackend::new("mailto:ops@example.com", Duration::from_secs(1)),
            Err(BackendError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpBackend::new("not a url", Duration::from_secs(1)),
            Err(BackendError::InvalidEndpoint(_))
        ));
    }
}
