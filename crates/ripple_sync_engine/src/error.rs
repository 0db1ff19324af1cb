//! Error types for the sync engine.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the sync client.
///
/// Two tiers: protocol-level failures are terminal for the connection,
/// while a query's server-reported failure is data, surfaced as
/// [`ClientError::QueryFailed`] when the value is read.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid frame, unexpected message, version skew).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Value encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] ripple_codec::CodecError),

    /// The server reported an unrecoverable failure.
    #[error("server error: {0}")]
    ServerError(String),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The channel has no established connection to transmit on.
    #[error("not connected to server")]
    NotConnected,

    /// The connection has ended.
    #[error("connection closed")]
    Closed,

    /// Connecting timed out.
    #[error("operation timed out")]
    Timeout,

    /// Invalid channel state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidState {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The query's latest result is a server-reported failure.
    #[error("query failed: {message}")]
    QueryFailed {
        /// Server-reported error message.
        message: String,
    },
}

impl ClientError {
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

    /// Creates an invalid-state error from two states.
    pub fn invalid_state(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Timeout => true,
            _ => false,
        }
    }
}
