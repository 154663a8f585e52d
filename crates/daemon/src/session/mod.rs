//! Session management module.
//!
//! A session is one long-lived shell process (or tmux attachment) together
//! with its scrollback, its activity tracker and the clients attached to it.
//! Sessions are created, looked up and removed through the
//! [`SessionRegistry`].
//!
//! Output flows from the backend's reader thread into a per-session pump,
//! which hands every chunk to the session's [`OutputObserver`]s in order:
//! the scrollback buffer, the activity tracker and the client broadcaster.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;

pub mod activity;
pub mod instance;
pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod scrollback;
pub mod tmux;

pub use activity::{classify, ActivityInput, ActivityPolicy, ActivityTracker};
pub use instance::{Attachment, Session, SessionSettings, SessionSpec};
pub use manager::{SessionRegistry, SessionRegistryImpl};
pub use multiplexer::{ClientHandle, ClientId, ClientStats, ClientSubscription, Outbound, SessionOutputBroadcaster};
pub use scrollback::{ScrollbackBuffer, ScrollbackRead};
pub use tmux::TmuxOptions;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A session with this name is already registered.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0} running)")]
    LimitReached(usize),

    /// The requested session name is not a valid identifier.
    #[error("invalid session name: {0:?}")]
    InvalidId(String),

    /// Failed to spawn the backend.
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    /// Terminal geometry with a zero dimension.
    #[error("invalid geometry: {cols}x{rows}")]
    InvalidGeometry {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// Failed to write to the backend.
    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    /// Failed to resize the backend.
    #[error("failed to resize session: {0}")]
    ResizeFailed(String),

    /// Failed to kill the backend.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscriber to a session's output stream.
///
/// Observers are driven by the session's pump under the session lock: every
/// chunk reaches every observer, in production order, before the next chunk
/// is taken. `on_exit` is called exactly once.
pub trait OutputObserver: Send {
    /// Called for every output chunk.
    fn on_output(&mut self, chunk: &Bytes, at: Instant);

    /// Called once when the backend exits.
    fn on_exit(&mut self, code: i32);
}

/// Returns the current Unix timestamp in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
