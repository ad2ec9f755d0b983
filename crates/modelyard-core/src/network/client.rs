//! Thin HTTP client wrapper.
//!
//! Centralizes timeouts, user-agent, optional bearer auth, and status-code
//! mapping into [`StoreError`] so transports share one failure vocabulary.

use crate::config::NetworkTuning;
use crate::error::{Result, StoreError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};

/// HTTP client shared by all transports.
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(NetworkTuning::CONNECT_TIMEOUT)
            .user_agent(NetworkTuning::USER_AGENT)
            .build()
            .map_err(|e| StoreError::Network {
                message: format!("failed to create HTTP client: {e}"),
                source: Some(e),
            })?;
        Ok(Self { client })
    }

    /// The underlying reqwest client, for request shapes the helpers don't
    /// cover (uploads, HEAD probes).
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET with optional extra headers and bearer token; success-checked.
    pub async fn get(
        &self,
        url: &str,
        headers: Option<HeaderMap>,
        bearer: Option<&str>,
    ) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, bearer_value(token)?);
        }

        let response = request.send().await.map_err(StoreError::from)?;
        Self::check_status(response, url)
    }

    /// Map a non-success status into the store's error taxonomy.
    ///
    /// 5xx, 408 and 429 are transient and retryable; 404 means the upstream
    /// identifier does not resolve; other client errors are definitive.
    pub fn check_status(response: Response, url: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(format!("{url} returned 404")),
            s if s.is_server_error()
                || s == StatusCode::REQUEST_TIMEOUT
                || s == StatusCode::TOO_MANY_REQUESTS =>
            {
                StoreError::Network {
                    message: format!("{url} returned {s}"),
                    source: None,
                }
            }
            s => StoreError::Http {
                status: s.as_u16(),
                url: url.to_string(),
            },
        })
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| StoreError::Config {
        message: "auth token contains invalid header characters".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        assert!(HttpClient::new().is_ok());
    }

    #[test]
    fn test_bearer_value() {
        assert!(bearer_value("abc123").is_ok());
        assert!(bearer_value("bad\ntoken").is_err());
    }
}
