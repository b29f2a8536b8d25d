use std::time::Duration;

use async_trait::async_trait;
use ferry_types::Record;

use crate::checkpoint::CheckpointState;
use crate::error::BufferResult;

/// Delivery guarantee offered by a buffer implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Unretired batches become readable again after a visibility timeout.
    AtLeastOnce,
    /// Checked-out batches are never redelivered.
    BestEffort,
}

/// Bounded queue between a source and the processing loop.
///
/// All implementations must satisfy these invariants:
/// - Safe for concurrent `write`/`read`/`checkpoint` from any task.
/// - `write` and `read` are the only operations that wait, and never longer
///   than the caller's timeout.
/// - `write_all` admits every record or none of them.
/// - A [`CheckpointState`] is redeemable at most once.
/// - `is_empty` is `true` only when nothing is queued or checked out.
#[async_trait]
pub trait Buffer<T: Send + 'static>: Send + Sync {
    /// Write one record, waiting up to `timeout` for capacity.
    async fn write(&self, record: Record<T>, timeout: Duration) -> BufferResult<()>;

    /// Write a batch atomically, waiting up to `timeout` for room for all of it.
    async fn write_all(&self, records: Vec<Record<T>>, timeout: Duration) -> BufferResult<()>;

    /// Wait up to `timeout` for at least one record and check out a batch.
    ///
    /// Returns an empty batch (with an empty token) if nothing arrived.
    async fn read(&self, timeout: Duration) -> BufferResult<(Vec<Record<T>>, CheckpointState)>;

    /// Retire a checked-out batch permanently.
    fn checkpoint(&self, state: CheckpointState) -> BufferResult<()>;

    fn is_empty(&self) -> bool;

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::AtLeastOnce
    }
}
