use thiserror::Error;

use crate::set::{AckSetId, AckSetStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("acknowledgement set {id} is already {status:?}")]
    SetTerminal { id: AckSetId, status: AckSetStatus },

    #[error("acknowledgement set {0} is sealed; no further events may be added")]
    SetSealed(AckSetId),

    #[error("event handle already released")]
    HandleReleased,
}

pub type AckResult<T> = std::result::Result<T, AckError>;
