//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame that is not valid JSON or does not match any message shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}
