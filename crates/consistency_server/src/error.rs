//! Error types for the invalidation server.

use consistency_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the invalidation server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The client sent a frame that is not a valid protocol message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No session with this id is open.
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    /// The session limit is reached.
    #[error("too many sessions (max {max})")]
    TooManySessions {
        /// Configured maximum.
        max: usize,
    },

    /// WebSocket handshake or framing error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the client caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::UnknownSession(_)
        )
    }

    /// Returns true if the server caused the error.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::TooManySessions { .. }
                | ServerError::WebSocket(_)
                | ServerError::Internal(_)
                | ServerError::Io(_)
        )
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encoding(message) => ServerError::Internal(message),
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::UnknownSession(3).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(ServerError::TooManySessions { max: 1 }.is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn protocol_errors_map_by_cause() {
        let err: ServerError = ProtocolError::Malformed("eof".into()).into();
        assert!(err.is_client_error());
        let err: ServerError = ProtocolError::Encoding("bad float".into()).into();
        assert!(err.is_server_error());
    }
}
