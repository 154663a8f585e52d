//! Error types for the protocol crate.

use thiserror::Error;

/// Errors raised while encoding, decoding or validating wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Session identifier is empty, too long, or uses characters outside the route charset.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Terminal geometry with a zero dimension.
    #[error("invalid geometry: {cols}x{rows} (both dimensions must be positive)")]
    InvalidGeometry {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_session_id_display() {
        let err = ProtocolError::InvalidSessionId("../etc".to_string());
        assert_eq!(err.to_string(), "invalid session id: \"../etc\"");
    }

    #[test]
    fn test_invalid_geometry_display() {
        let err = ProtocolError::InvalidGeometry { cols: 0, rows: 24 };
        assert_eq!(
            err.to_string(),
            "invalid geometry: 0x24 (both dimensions must be positive)"
        );
    }

    #[test]
    fn test_malformed_json_is_deserialization() {
        let err: ProtocolError = serde_json::from_str::<i32>("not a number").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));

        let err: ProtocolError = serde_json::from_str::<i32>("").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
