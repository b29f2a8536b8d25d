use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use ferry_types::Record;

use crate::error::BufferResult;
use crate::traits::Buffer;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Flush once this many records are pending.
    pub records_to_accumulate: usize,
    /// Flush on the next `add` once this long has passed since the last flush.
    pub flush_interval: Duration,
    /// Timeout handed to each `write_all` attempt.
    pub write_timeout: Duration,
    /// Attempts per flush before a retryable error is returned to the caller.
    pub max_write_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            records_to_accumulate: 100,
            flush_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            max_write_attempts: 10,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// Collects records from a source and writes them to a buffer in batches.
///
/// Backpressure (`WriteTimeout`, `CircuitOpen`) is retried with jittered
/// exponential backoff. Records stay pending across a failed flush, so a
/// later `flush` retries them.
pub struct BufferAccumulator<T: Send + 'static> {
    buffer: Arc<dyn Buffer<T>>,
    config: AccumulatorConfig,
    pending: Vec<Record<T>>,
    last_flush: Instant,
    total_written: u64,
}

impl<T: Clone + Send + 'static> BufferAccumulator<T> {
    pub fn new(buffer: Arc<dyn Buffer<T>>, config: AccumulatorConfig) -> Self {
        Self {
            buffer,
            pending: Vec::with_capacity(config.records_to_accumulate),
            config,
            last_flush: Instant::now(),
            total_written: 0,
        }
    }

    /// Add one record, flushing if the count or age threshold is reached.
    pub async fn add(&mut self, record: Record<T>) -> BufferResult<()> {
        self.pending.push(record);
        if self.pending.len() >= self.config.records_to_accumulate
            || self.last_flush.elapsed() >= self.config.flush_interval
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write every pending record to the buffer.
    pub async fn flush(&mut self) -> BufferResult<()> {
        if self.pending.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        let mut delay = self.config.backoff_base;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .buffer
                .write_all(self.pending.clone(), self.config.write_timeout)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.config.max_write_attempts => {
                    let pause = jittered(delay);
                    warn!(attempt, error = %e, backoff_ms = pause.as_millis() as u64, "buffer write failed; backing off");
                    tokio::time::sleep(pause).await;
                    delay = (delay * 2).min(self.config.backoff_max);
                }
                Err(e) => return Err(e),
            }
        }

        let written = self.pending.len();
        self.pending.clear();
        self.total_written += written as u64;
        self.last_flush = Instant::now();
        debug!(records = written, attempts = attempt, "accumulator flushed");
        Ok(())
    }

    /// Flush what remains and return the total number of records written.
    pub async fn close(mut self) -> BufferResult<u64> {
        self.flush().await?;
        Ok(self.total_written)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

/// Pending records are handed to a background `write_all` when a runtime is
/// available. Outside a runtime they are lost, so prefer `close().await`.
impl<T: Send + 'static> Drop for BufferAccumulator<T> {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.pending);
        let count = records.len();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(records = count, "accumulator dropped with unflushed records; writing in background");
                let buffer = self.buffer.clone();
                let timeout = self.config.write_timeout;
                runtime.spawn(async move {
                    if let Err(e) = buffer.write_all(records, timeout).await {
                        error!(records = count, error = %e, "background flush of dropped accumulator failed");
                    }
                });
            }
            Err(_) => error!(
                records = count,
                "accumulator dropped outside a runtime with unflushed records"
            ),
        }
    }
}

/// Half the delay plus a random share of the other half.
fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    let spread = half.as_millis() as u64;
    let extra = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    half + Duration::from_millis(extra)
}
