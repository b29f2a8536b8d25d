use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one checked-out batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(u64);

impl CheckpointId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ckpt-{}", self.0)
    }
}

/// Opaque token returned by `Buffer::read`.
///
/// Represents "this batch of `num_records` records is checked out". Exactly
/// one successful `checkpoint` retires it. A token for an empty read carries
/// zero records and checkpointing it is a no-op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointState {
    id: CheckpointId,
    num_records: usize,
}

impl CheckpointState {
    pub fn new(id: CheckpointId, num_records: usize) -> Self {
        Self { id, num_records }
    }

    pub fn id(&self) -> CheckpointId {
        self.id
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }
}
