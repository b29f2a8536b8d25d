use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordError {
    /// The lease expired or another node took the partition over. Stop
    /// working on it and ask for a new partition.
    #[error("partition {key:?} is not owned by this node")]
    PartitionNotOwned { key: String },

    #[error("partition {key:?} not found")]
    PartitionNotFound { key: String },

    /// The stored version moved on since the item was read.
    #[error("conditional update of partition {key:?} failed")]
    ConditionalUpdateFailed { key: String },

    #[error("invalid coordinator configuration: {0}")]
    Config(String),

    #[error("coordination store error: {0}")]
    Store(String),

    #[error("partition supplier failed: {0}")]
    Supplier(String),
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;
