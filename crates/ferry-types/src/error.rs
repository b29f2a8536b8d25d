use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("event type must not be empty")]
    EmptyEventType,

    #[error("invalid event key: {0:?}")]
    InvalidKey(String),

    #[error("cannot write {key:?}: an intermediate value is not an object")]
    PathConflict { key: String },

    #[error("event handle already released")]
    HandleReleased,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("dead-letter write failed: {0}")]
    DeadLetter(String),
}
