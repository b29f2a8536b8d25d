use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry_types::{CircuitBreaker, Record};
use tracing::debug;

use crate::checkpoint::CheckpointState;
use crate::error::{BufferError, BufferResult};
use crate::traits::{Buffer, DeliveryMode};

/// Rejects writes with [`BufferError::CircuitOpen`] while the breaker is open.
///
/// Reads and checkpoints pass through untouched so the pipeline keeps
/// draining what was already admitted.
pub struct CircuitBreakingBuffer<T> {
    inner: Arc<dyn Buffer<T>>,
    breaker: Arc<dyn CircuitBreaker>,
}

impl<T: Send + 'static> CircuitBreakingBuffer<T> {
    pub fn new(inner: Arc<dyn Buffer<T>>, breaker: Arc<dyn CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    fn admit(&self) -> BufferResult<()> {
        if self.breaker.is_open() {
            debug!("circuit open; rejecting buffer write");
            return Err(BufferError::CircuitOpen);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Buffer<T> for CircuitBreakingBuffer<T> {
    async fn write(&self, record: Record<T>, timeout: Duration) -> BufferResult<()> {
        self.admit()?;
        self.inner.write(record, timeout).await
    }

    async fn write_all(&self, records: Vec<Record<T>>, timeout: Duration) -> BufferResult<()> {
        self.admit()?;
        self.inner.write_all(records, timeout).await
    }

    async fn read(&self, timeout: Duration) -> BufferResult<(Vec<Record<T>>, CheckpointState)> {
        self.inner.read(timeout).await
    }

    fn checkpoint(&self, state: CheckpointState) -> BufferResult<()> {
        self.inner.checkpoint(state)
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.inner.delivery_mode()
    }
}
