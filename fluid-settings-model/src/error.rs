//! Error type for model-level parsing and validation.

use thiserror::Error;

/// Errors raised while parsing or validating wire-level primitives.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("priority {0} is out of range (0 .. 99)")]
    PriorityOutOfRange(i64),

    #[error("invalid priority: {0:?}")]
    InvalidPriority(String),

    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("empty message line")]
    EmptyMessage,

    #[error("invalid message command: {0:?}")]
    InvalidCommand(String),

    #[error("malformed message parameter: {0:?}")]
    MalformedParameter(String),

    #[error("malformed message address: {0:?}")]
    MalformedAddress(String),
}
