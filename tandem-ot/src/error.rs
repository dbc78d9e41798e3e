use thiserror::Error;

/// Errors raised by the operation model, codec and transform functions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    #[error("Malformed operation: {0}")]
    Malformed(String),

    /// Two operations handed to `transform` were not generated against
    /// documents of the same length.
    #[error("Base length mismatch: left spans {left} chars, right spans {right}")]
    BaseLengthMismatch { left: usize, right: usize },

    #[error("Compose length mismatch: first produces {first} chars, second expects {second}")]
    ComposeLengthMismatch { first: usize, second: usize },

    #[error("Operation expects a document of {expected} chars, got {actual}")]
    ApplyLengthMismatch { expected: usize, actual: usize },
}
