//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match the envelope shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The envelope is well formed but its `data` does not fit the kind.
    #[error("invalid payload for '{kind}': {message}")]
    InvalidPayload {
        /// Message kind named in the envelope.
        kind: String,
        /// Description of the problem.
        message: String,
    },

    /// Failed to serialize an outbound message.
    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl ProtocolError {
    pub(crate) fn invalid_payload(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
