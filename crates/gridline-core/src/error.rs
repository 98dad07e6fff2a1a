//! Error types for orchestration operations

use thiserror::Error;

use crate::job::ExecutionError;

#[derive(Error, Debug)]
pub enum GridlineError {
    /// The start or end status job could not be run. Not retried: the
    /// reporting channel itself is presumed broken.
    #[error("status report for check `{check}` failed: {source}")]
    Reporting {
        check: String,
        #[source]
        source: ExecutionError,
    },

    #[error("invalid pipeline state transition: {current} -> {requested}")]
    InvalidStateTransition { current: String, requested: String },

    #[error("pipeline task `{pipeline}` aborted: {reason}")]
    PipelineAborted { pipeline: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, GridlineError>;
