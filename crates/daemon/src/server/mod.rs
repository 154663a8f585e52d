//! HTTP and WebSocket surface of the daemon.
//!
//! - `GET /health` is public.
//! - `/api/sessions/...` is the REST API (create, list, inspect, kill,
//!   input, resize, catch-up output).
//! - `/ws/{sessionId}` is the push transport.
//!
//! Everything except `/health` goes through [`auth::require_token`].

pub mod api;
pub mod auth;
pub mod error;
pub mod gateway;
pub mod heartbeat;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::Authenticator;
pub use error::ApiError;
pub use heartbeat::{Heartbeat, HeartbeatAction, DEFAULT_HEARTBEAT_INTERVAL};

use crate::session::SessionRegistryImpl;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// The session registry.
    pub registry: Arc<SessionRegistryImpl>,
    /// Credential check.
    pub auth: Authenticator,
    /// Push transport heartbeat period.
    pub heartbeat_interval: Duration,
    /// When the daemon started, for `/health`.
    pub started_at: Instant,
    /// Cancelled when the daemon shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Creates state with default heartbeat and no authentication.
    pub fn new(registry: Arc<SessionRegistryImpl>) -> Self {
        Self {
            registry,
            auth: Authenticator::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Requires `token` on every protected route.
    pub fn with_auth_token(mut self, token: Option<&str>) -> Self {
        self.auth = Authenticator::new(token);
        self
    }

    /// Overrides the heartbeat period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Uses an existing shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(api::get_session).delete(api::delete_session),
        )
        .route("/api/sessions/:id/input", post(api::send_input))
        .route("/api/sessions/:id/resize", post(api::resize_session))
        .route("/api/sessions/:id/output", get(api::read_output))
        .route("/ws/:id", get(gateway::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(api::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until the state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "HTTP server listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
