//! Shared-secret authentication.
//!
//! Requests present the configured token either as
//! `Authorization: Bearer <token>` or as a `?token=` query parameter (for
//! browsers, which cannot set headers on WebSocket upgrades). With no token
//! configured every request is allowed.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use super::error::ApiError;
use super::AppState;

/// Checks presented credentials against the configured token.
#[derive(Clone, Default)]
pub struct Authenticator {
    digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Authenticator {
    /// Creates an authenticator. `None` or an empty token disables checks.
    pub fn new(token: Option<&str>) -> Self {
        Self {
            digest: token.filter(|t| !t.is_empty()).map(digest),
        }
    }

    /// Returns whether a token is configured.
    pub fn is_enabled(&self) -> bool {
        self.digest.is_some()
    }

    /// Returns whether `presented` matches the configured token.
    pub fn verify(&self, presented: Option<&str>) -> bool {
        match (&self.digest, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => digest(presented) == *expected,
            (Some(_), None) => false,
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Extracts the presented token from the headers or the query string.
pub fn presented_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    if bearer.is_some() {
        return bearer;
    }

    query.and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    })
}

/// Middleware rejecting unauthenticated requests with 401 before any handler
/// (or WebSocket upgrade) runs.
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = presented_token(request.headers(), request.uri().query());
    if state.auth.verify(token.as_deref()) {
        return next.run(request).await;
    }

    tracing::warn!(
        path = %request.uri().path(),
        presented = token.is_some(),
        "Rejected unauthenticated request"
    );
    ApiError::Unauthorized.into_response()
}
