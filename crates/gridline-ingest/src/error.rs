//! Error types for event decoding

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed event body: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Event Grid delivered `[]`.
    #[error("event batch is empty")]
    EmptyBatch,

    #[error("subscription validation event has no validationCode")]
    MissingValidationCode,

    #[error("event has no type")]
    MissingEventType,

    #[error("delivery token does not match the project token")]
    Forbidden,
}

/// Result type for decoding operations
pub type Result<T> = std::result::Result<T, IngestError>;
