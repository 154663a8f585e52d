//! HTTP side of the viewer: health probes and catch-up polling.

use std::time::Duration;

use protocol::{HealthResponse, OutputResponse};
use reqwest::StatusCode;
use url::Url;

use crate::error::{Result, ViewerError};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain HTTP client for `/health` and `/api/sessions/{id}/output`.
#[derive(Debug, Clone)]
pub struct CatchUpClient {
    base: Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl CatchUpClient {
    /// Creates a client for the daemon at `base` (e.g. `http://127.0.0.1:7681`).
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| ViewerError::InvalidUrl(format!("{base}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ViewerError::InvalidUrl(base.to_string()));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base, token, http })
    }

    /// Daemon base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Credential sent with each request.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ViewerError::InvalidUrl(format!("{path}: {e}")))
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Liveness probe.
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.get(self.url("/health")?).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    /// Fetches output from `offset` onward.
    ///
    /// Pass the returned `offset` back on the next call. `truncated` in the
    /// response means bytes before `start_offset` were evicted.
    pub async fn fetch(&self, session_id: &str, offset: u64) -> Result<OutputResponse> {
        protocol::validate_session_id(session_id)?;
        let mut url = self.url(&format!("/api/sessions/{session_id}/output"))?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string());

        let response = self.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ViewerError::SessionNotFound(session_id.to_string())),
            StatusCode::UNAUTHORIZED => Err(ViewerError::Unauthorized),
            status => Err(ViewerError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Push transport URL for `session_id`, carrying the token as a query
    /// parameter.
    pub fn push_url(&self, session_id: &str) -> Result<Url> {
        protocol::validate_session_id(session_id)?;
        let mut url = self.url(&format!("/ws/{session_id}"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ViewerError::InvalidUrl(url.to_string()))?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_base() {
        assert!(matches!(
            CatchUpClient::new("ftp://example.com", None),
            Err(ViewerError::InvalidUrl(_))
        ));
        assert!(matches!(
            CatchUpClient::new("not a url", None),
            Err(ViewerError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_push_url() {
        let client = CatchUpClient::new("http://127.0.0.1:7681", None).unwrap();
        assert_eq!(
            client.push_url("abc-123").unwrap().as_str(),
            "ws://127.0.0.1:7681/ws/abc-123"
        );

        let client =
            CatchUpClient::new("https://shell.example.com", Some("a b".to_string())).unwrap();
        assert_eq!(
            client.push_url("main").unwrap().as_str(),
            "wss://shell.example.com/ws/main?token=a+b"
        );
    }

    #[test]
    fn test_push_url_validates_id() {
        let client = CatchUpClient::new("http://127.0.0.1:7681", None).unwrap();
        assert!(matches!(
            client.push_url("../etc"),
            Err(ViewerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_health_against_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = CatchUpClient::new(&format!("http://{addr}"), None).unwrap();
        assert!(matches!(client.health().await, Err(ViewerError::Http(_))));
    }
}
