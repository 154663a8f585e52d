//! Protocol message definitions for Shellcast.
//!
//! Two surfaces share these types:
//!
//! - the push transport (`/ws/{sessionId}`): JSON text frames tagged by
//!   `type`, plus raw binary frames carrying terminal output;
//! - the REST API (`/api/sessions/...`): JSON request and response bodies,
//!   including the offset-addressed catch-up endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Close code sent after a normal end of stream (session exited).
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the daemon is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code sent when a client missed a full heartbeat interval.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Close code sent when the requested session does not exist.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;

/// Close code sent when a client could not keep up with the output stream.
pub const CLOSE_CLIENT_TOO_SLOW: u16 = 4008;

/// Maximum length of a session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Checks that a session identifier only uses the route charset.
///
/// Accepted identifiers are UUIDs (hex and hyphen) and tmux-style names
/// made of ASCII alphanumerics, `-` and `_`.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidSessionId(id.to_string()))
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The backend process is alive.
    Running,
    /// The backend process has exited (or was killed).
    Exited,
}

/// Coarse activity classification of a session's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// No output for the quiet window.
    Idle,
    /// Output is actively arriving.
    Busy,
    /// Terminal state, set only when the backend exits.
    Exited,
}

/// Kind of process backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A shell spawned directly on a pseudo-terminal.
    Pty,
    /// An attachment to a named tmux session.
    Tmux,
}

// ============================================================================
// Push transport: inbound (viewer -> daemon)
// ============================================================================

/// Messages a viewer sends over the push transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Raw input for the shell.
    Input {
        /// Bytes to write, as text.
        data: String,
    },
    /// Terminal geometry change.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// Application-level heartbeat reply.
    Pong {
        /// Echo of the ping timestamp, if the viewer sends one.
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

impl ClientMessage {
    /// Parses a text frame.
    ///
    /// Returns `Ok(None)` for shapes this protocol does not know (no `type`,
    /// or an unrecognized `type`), which callers ignore. A known `type` with a
    /// malformed payload (e.g. a negative or fractional resize dimension) is
    /// an error.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let known = matches!(
            value.get("type").and_then(|t| t.as_str()),
            Some("input" | "resize" | "pong")
        );
        if !known {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ============================================================================
// Push transport: outbound (daemon -> viewer)
// ============================================================================

/// JSON messages the daemon sends over the push transport.
///
/// Terminal output itself travels as binary frames and is not represented
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once after a successful attach, right before the scrollback replay.
    #[serde(rename_all = "camelCase")]
    Attached {
        /// Session the viewer is attached to.
        session_id: String,
        /// Stream offset of the first replayed byte.
        offset: u64,
        /// Stream offset just past the last replayed byte.
        end_offset: u64,
        /// Whether older output was evicted before `offset`.
        truncated: bool,
        /// Session status at attach time.
        status: SessionStatus,
        /// Current columns, if known.
        cols: Option<u16>,
        /// Current rows, if known.
        rows: Option<u16>,
    },
    /// The session's process exited. Sent exactly once per client.
    Exit {
        /// Process exit code.
        code: i32,
    },
    /// A protocol-level error, sent before any non-normal close.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// Application-level heartbeat probe.
    Ping {
        /// Unix milliseconds at send time.
        timestamp: u64,
    },
    /// Activity classification changed.
    Activity {
        /// New state.
        state: ActivityState,
    },
}

impl ServerMessage {
    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// REST API
// ============================================================================

/// Request body for `POST /api/sessions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    /// Program to run. Defaults to the configured shell.
    pub command: Option<String>,
    /// Arguments for the program.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Initial columns.
    pub cols: Option<u16>,
    /// Initial rows.
    pub rows: Option<u16>,
    /// Attach to (or create) this named tmux session instead of spawning a shell.
    pub tmux_session: Option<String>,
}

/// Request body for `POST /api/sessions/{id}/input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    /// Raw input for the shell.
    pub data: String,
}

/// Request body for `POST /api/sessions/{id}/resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl ResizeRequest {
    /// Rejects geometries with a zero dimension.
    pub fn validate(&self) -> Result<()> {
        if self.cols == 0 || self.rows == 0 {
            return Err(ProtocolError::InvalidGeometry {
                cols: self.cols,
                rows: self.rows,
            });
        }
        Ok(())
    }
}

/// Snapshot of a session as reported by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session identifier.
    pub id: String,
    /// Backend kind.
    pub backend: BackendKind,
    /// Program that was spawned.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory, if one was requested.
    pub cwd: Option<String>,
    /// Process ID of the backend child, if available.
    pub pid: Option<u32>,
    /// Current columns, `None` until known.
    pub cols: Option<u16>,
    /// Current rows, `None` until known.
    pub rows: Option<u16>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Exit code, present once exited.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,
    /// Activity classification.
    pub activity: ActivityState,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
    /// Time of the last output chunk, Unix milliseconds.
    pub last_activity: u64,
    /// Number of attached push clients.
    pub clients: usize,
    /// Stream offset of the oldest retained scrollback byte.
    pub start_offset: u64,
    /// Total bytes produced so far.
    pub offset: u64,
}

/// Query string for `GET /api/sessions/{id}/output`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputQuery {
    /// The caller's last known stream offset.
    #[serde(default)]
    pub offset: u64,
}

/// Response body for `GET /api/sessions/{id}/output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    /// Output from `startOffset` to `offset`, cut at character boundaries.
    /// Bytes that are not valid UTF-8 are replaced with U+FFFD.
    pub output: String,
    /// New cursor: pass it back as `offset` on the next poll.
    pub offset: u64,
    /// Stream offset of the first byte in `output`.
    pub start_offset: u64,
    /// The requested offset was not retained; `output` starts later than asked.
    pub truncated: bool,
    /// Session status.
    pub status: SessionStatus,
    /// Exit code, present whenever known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the daemon answers.
    pub status: String,
    /// Number of registered sessions.
    pub sessions: usize,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
    /// Daemon version.
    pub version: String,
}

/// JSON error body returned by every failing REST call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}
