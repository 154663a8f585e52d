//! # Shellcast Daemon Library
//!
//! This crate provides the daemon (server) functionality for Shellcast:
//! long-lived shell sessions that any number of viewers can attach to,
//! detach from and re-attach to without disturbing the process.
//!
//! ## Overview
//!
//! - **Session Management**: Spawn shells on a PTY, or attach to named tmux
//!   sessions, and keep them running between viewer connections
//! - **Scrollback**: Bounded, offset-addressed history replayed on attach
//! - **Activity**: Idle/busy classification of each session's output
//! - **Fan-out Gateway**: One WebSocket per viewer, with heartbeats and
//!   slow-client eviction
//! - **REST API**: Create, inspect, drive and kill sessions, plus catch-up
//!   polling for viewers without a push connection
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐   ┌──────────────────────────┐   │
//! │  │  axum router           │   │  Session Registry        │   │
//! │  │  /health  /api  /ws    │──▶│  (DashMap of sessions)   │   │
//! │  └────────────────────────┘   └────────────┬─────────────┘   │
//! │                                            │                 │
//! │        per session: backend → pump → scrollback / activity   │
//! │                                         / client broadcaster │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session backends, scrollback, activity and registry
//! - [`server`]: HTTP API, push gateway, heartbeat and authentication
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    Session, SessionError, SessionId, SessionRegistry, SessionRegistryImpl, SessionSettings,
    SessionSpec,
};

// Re-export server types for convenience
pub use server::{router, serve, ApiError, AppState};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
