//! Daemon lifecycle.
//!
//! [`DaemonOrchestrator`] owns the session registry, binds the HTTP server
//! and ties registry teardown to daemon shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::server::{self, AppState};
use crate::session::{SessionRegistry, SessionRegistryImpl};

/// How long `stop` waits for open connections to close.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The HTTP server is accepting connections.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Owns the listener task and the session registry for one daemon run.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry of live sessions.
    registry: Arc<SessionRegistryImpl>,
    /// Address the server is bound to, once started.
    local_addr: Option<SocketAddr>,
    /// The serving task.
    server_task: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Validates `config` and builds an idle orchestrator with an empty registry.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(SessionRegistryImpl::new(
            config.session_settings(),
            config.session.max_sessions,
        ));
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            local_addr: None,
            server_task: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts serving on the configured bind address.
    pub async fn start(&mut self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        self.start_with_listener(listener).await
    }

    /// Starts serving on an already bound listener.
    pub async fn start_with_listener(&mut self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        // A previous stop() leaves the token cancelled.
        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }

        info!("Starting daemon orchestrator...");

        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(addr);

        let app_state = AppState::new(Arc::clone(&self.registry))
            .with_auth_token(self.config.server.auth_token.as_deref())
            .with_heartbeat_interval(self.config.heartbeat_interval())
            .with_shutdown(self.shutdown_token.clone());

        if app_state.auth.is_enabled() {
            info!("Token authentication enabled");
        } else {
            warn!("No auth_token configured, API is unauthenticated");
        }

        let event_tx = self.event_tx.clone();
        self.server_task = Some(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, app_state).await {
                error!("HTTP server failed: {}", e);
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        }));

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::Listening { addr });
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = %addr, "Daemon orchestrator started successfully");
        Ok(())
    }

    /// Closes push connections, drains the server, then shuts every session down.
    ///
    /// Open push connections are closed with "going away", then every
    /// session is shut down.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(task) = self.server_task.take() {
            match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("HTTP server stopped"),
                Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
                Err(_) => warn!("HTTP server did not drain in time"),
            }
        }

        self.registry.shutdown().await;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistryImpl> {
        &self.registry
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token cancelled when the daemon begins shutting down.
    ///
    /// Each start after a stop gets a fresh token, so fetch it after `start`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
