//! Error types for the synchronization engine.

use consistency_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the synchronization engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The channel is not open.
    #[error("not connected to server")]
    NotConnected,

    /// `start` was called while a channel is connecting or open.
    #[error("connection already started (state: {state})")]
    AlreadyStarted {
        /// State the connection was in.
        state: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A payload could not be decoded with the resource's decoder.
    #[error("failed to decode payload for {uri}: {message}")]
    Decode {
        /// Subscription key of the resource.
        uri: String,
        /// Decoder error message.
        message: String,
    },

    /// A fetch could not be issued.
    #[error("fetch of {url} failed: {message}")]
    Fetch {
        /// Fetch URL.
        url: String,
        /// Error message.
        message: String,
    },

    /// The same listener instance was registered twice on one resource.
    #[error("listener is already registered on this resource")]
    ListenerAlreadyRegistered,

    /// Endpoint could not be parsed or has an unsupported scheme.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            SyncError::Fetch { .. } => true,
            _ => false,
        }
    }
}
