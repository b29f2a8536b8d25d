use std::io;
use std::time::Duration;

use crate::checkpoint::CheckpointId;

/// Errors produced by buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// No capacity became available before the write deadline.
    #[error("buffer write timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    /// A single `write_all` asked for more room than the buffer can ever hold.
    #[error("batch of {requested} records exceeds buffer capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// The admission circuit breaker is open.
    #[error("circuit breaker is open; write rejected")]
    CircuitOpen,

    /// The token was already redeemed, or its batch was redelivered after
    /// the visibility timeout.
    #[error("checkpoint {0} is not outstanding")]
    CheckpointNotOutstanding(CheckpointId),

    /// The token was never issued by this buffer or does not match the batch.
    #[error("invalid checkpoint token {id}")]
    InvalidCheckpoint { id: CheckpointId },

    /// Invalid buffer configuration.
    #[error("invalid buffer configuration: {0}")]
    Config(String),

    /// I/O error from the write-ahead log.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BufferError {
    /// Returns `true` for backpressure errors the caller may retry after
    /// backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteTimeout { .. } | Self::CircuitOpen)
    }
}

/// Convenience alias used throughout the buffer crate.
pub type BufferResult<T> = std::result::Result<T, BufferError>;
