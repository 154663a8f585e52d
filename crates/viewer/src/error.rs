//! Error types for the viewer.

use protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur on the viewer side.
#[derive(Error, Debug)]
pub enum ViewerError {
    /// The daemon URL could not be parsed or turned into a push URL.
    #[error("invalid daemon url: {0}")]
    InvalidUrl(String),

    /// An HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The push transport failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The daemon rejected the credential.
    #[error("unauthorized")]
    Unauthorized,

    /// The session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The daemon answered with an unexpected status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// No push connection is established.
    #[error("not connected")]
    NotConnected,

    /// Malformed wire data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ViewerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) if response.status().as_u16() == 401 => {
                ViewerError::Unauthorized
            }
            other => ViewerError::WebSocket(other.to_string()),
        }
    }
}

/// Result type for viewer operations.
pub type Result<T> = std::result::Result<T, ViewerError>;
