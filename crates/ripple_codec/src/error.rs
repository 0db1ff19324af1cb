//! Error types for the codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The input was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A float with no JSON representation.
    #[error("non-finite float has no canonical encoding")]
    NonFiniteFloat,

    /// A number outside the supported value range.
    #[error("unsupported number: {0}")]
    UnsupportedNumber(String),

    /// The value had an unexpected shape.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl CodecError {
    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CodecError::NonFiniteFloat;
        assert_eq!(
            err.to_string(),
            "non-finite float has no canonical encoding"
        );

        let err = CodecError::invalid_structure("expected map");
        assert_eq!(err.to_string(), "invalid structure: expected map");
    }
}
