//! # Shellcast Protocol Library
//!
//! Wire definitions shared by the Shellcast daemon and its viewers.
//!
//! ## Overview
//!
//! - **Push transport**: JSON control messages ([`ClientMessage`],
//!   [`ServerMessage`]) and close codes for `/ws/{sessionId}`. Terminal output
//!   travels as raw binary frames.
//! - **REST API**: request/response bodies for session management and the
//!   offset-addressed catch-up endpoint.
//! - **Validation**: the session-id route charset and geometry checks.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage};
//!
//! let msg = ClientMessage::parse(r#"{"type":"resize","cols":120,"rows":40}"#)
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(msg, ClientMessage::Resize { cols: 120, rows: 40 });
//!
//! let exit = ServerMessage::Exit { code: 0 }.to_json().unwrap();
//! assert_eq!(exit, r#"{"type":"exit","code":0}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    validate_session_id, ActivityState, BackendKind, ClientMessage, CreateSessionRequest,
    ErrorBody, HealthResponse, InputRequest, OutputQuery, OutputResponse, ResizeRequest,
    ServerMessage, SessionInfo, SessionStatus, CLOSE_CLIENT_TOO_SLOW, CLOSE_GOING_AWAY,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, CLOSE_SESSION_NOT_FOUND, MAX_SESSION_ID_LEN,
};
