use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ferry_types::Record;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointId, CheckpointState};
use crate::error::{BufferError, BufferResult};
use crate::traits::{Buffer, DeliveryMode};

/// Sizing and delivery settings for a [`BlockingBuffer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum records held, counting both queued and checked-out records.
    pub capacity: usize,
    /// Maximum records returned by one `read`.
    pub batch_size: usize,
    /// How long a `read` that already has records keeps waiting to fill
    /// the batch. Zero returns whatever is available immediately.
    pub batch_delay: Duration,
    /// How long a checked-out batch stays invisible before it is redelivered.
    /// `None` selects best-effort delivery.
    pub visibility_timeout: Option<Duration>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 12_800,
            batch_size: 200,
            batch_delay: Duration::ZERO,
            visibility_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> BufferResult<()> {
        if self.capacity == 0 {
            return Err(BufferError::Config("capacity must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(BufferError::Config("batch_size must be positive".into()));
        }
        if self.visibility_timeout == Some(Duration::ZERO) {
            return Err(BufferError::Config(
                "visibility_timeout must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

struct Checkout<T> {
    /// Empty in best-effort mode, where batches are never redelivered.
    entries: Vec<(u64, Record<T>)>,
    count: usize,
    deadline: Option<Instant>,
}

struct State<T> {
    queue: VecDeque<(u64, Record<T>)>,
    in_flight: HashMap<CheckpointId, Checkout<T>>,
    checked_out: usize,
    next_seq: u64,
    next_checkpoint: u64,
}

impl<T> State<T> {
    fn used(&self) -> usize {
        self.queue.len() + self.checked_out
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().filter_map(|c| c.deadline).min()
    }
}

/// Bounded in-memory buffer with checkpointed reads.
///
/// Writers wait for capacity; readers wait for records. A read checks out a
/// batch under a fresh [`CheckpointState`]. The batch keeps counting against
/// capacity until it is checkpointed, or until its visibility timeout lapses
/// and it is put back at the front of the queue.
pub struct BlockingBuffer<T> {
    config: BufferConfig,
    state: Mutex<State<T>>,
    space_available: Notify,
    records_available: Notify,
}

impl<T: Clone + Send + Sync + 'static> BlockingBuffer<T> {
    pub fn new(config: BufferConfig) -> BufferResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
                checked_out: 0,
                next_seq: 0,
                next_checkpoint: 0,
            }),
            space_available: Notify::new(),
            records_available: Notify::new(),
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Records waiting to be read.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Records checked out and not yet checkpointed.
    pub fn in_flight(&self) -> usize {
        self.lock().checked_out
    }

    /// Admit records without waiting. Used when replaying a log at startup.
    pub(crate) fn preload(&self, records: Vec<Record<T>>) {
        let mut state = self.lock();
        for record in records {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push_back((seq, record));
        }
    }

    /// Checkpoints still awaiting `checkpoint`, and how many tokens have
    /// been issued so far. Expired checkouts are reclaimed first.
    pub(crate) fn outstanding_checkpoints(&self) -> (HashSet<CheckpointId>, u64) {
        let mut state = self.lock();
        self.reclaim_expired(&mut state, Instant::now());
        (state.in_flight.keys().copied().collect(), state.next_checkpoint)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().expect("buffer lock poisoned")
    }

    /// Return expired checkouts to the front of the queue, oldest first.
    fn reclaim_expired(&self, state: &mut State<T>, now: Instant) {
        let expired: Vec<CheckpointId> = state
            .in_flight
            .iter()
            .filter(|(_, c)| c.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut requeue = Vec::new();
        for id in expired {
            if let Some(checkout) = state.in_flight.remove(&id) {
                state.checked_out -= checkout.count;
                warn!(
                    checkpoint = %id,
                    records = checkout.count,
                    "checkpoint not received within visibility timeout; redelivering"
                );
                requeue.extend(checkout.entries);
            }
        }
        requeue.sort_by_key(|(seq, _)| *seq);
        for entry in requeue.into_iter().rev() {
            state.queue.push_front(entry);
        }
    }

    fn check_out(&self, state: &mut State<T>, now: Instant) -> (Vec<Record<T>>, CheckpointState) {
        let take = state.queue.len().min(self.config.batch_size);
        let entries: Vec<(u64, Record<T>)> = state.queue.drain(..take).collect();
        let records: Vec<Record<T>> = entries.iter().map(|(_, r)| r.clone()).collect();

        let id = CheckpointId::new(state.next_checkpoint);
        state.next_checkpoint += 1;
        if take == 0 {
            return (records, CheckpointState::new(id, 0));
        }

        let (entries, deadline) = match self.config.visibility_timeout {
            Some(visibility) => (entries, Some(now + visibility)),
            None => (Vec::new(), None),
        };
        state.checked_out += take;
        state.in_flight.insert(
            id,
            Checkout {
                entries,
                count: take,
                deadline,
            },
        );
        debug!(checkpoint = %id, records = take, "batch checked out");
        (records, CheckpointState::new(id, take))
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Buffer<T> for BlockingBuffer<T> {
    async fn write(&self, record: Record<T>, timeout: Duration) -> BufferResult<()> {
        self.write_all(vec![record], timeout).await
    }

    async fn write_all(&self, records: Vec<Record<T>>, timeout: Duration) -> BufferResult<()> {
        let needed = records.len();
        if needed == 0 {
            return Ok(());
        }
        if needed > self.config.capacity {
            return Err(BufferError::CapacityExceeded {
                requested: needed,
                capacity: self.config.capacity,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                self.reclaim_expired(&mut state, Instant::now());
                if state.used() + needed <= self.config.capacity {
                    for record in records {
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        state.queue.push_back((seq, record));
                    }
                    drop(state);
                    self.records_available.notify_waiters();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BufferError::WriteTimeout { timeout });
            }
        }
    }

    async fn read(&self, timeout: Duration) -> BufferResult<(Vec<Record<T>>, CheckpointState)> {
        let start = Instant::now();
        let read_deadline = start + timeout;
        let batch_deadline = start + self.config.batch_delay.min(timeout);

        loop {
            let notified = self.records_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                let now = Instant::now();
                self.reclaim_expired(&mut state, now);

                let available = state.queue.len();
                let full = available >= self.config.batch_size;
                if full || (available > 0 && now >= batch_deadline) || now >= read_deadline {
                    return Ok(self.check_out(&mut state, now));
                }

                let target = if available == 0 { read_deadline } else { batch_deadline };
                match state.next_expiry() {
                    Some(expiry) => target.min(expiry),
                    None => target,
                }
            };

            // Either outcome re-evaluates the queue.
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    fn checkpoint(&self, token: CheckpointState) -> BufferResult<()> {
        if token.is_empty() {
            return Ok(());
        }
        let id = token.id();

        let mut state = self.lock();
        if id.as_u64() >= state.next_checkpoint {
            return Err(BufferError::InvalidCheckpoint { id });
        }
        let Some(checkout) = state.in_flight.remove(&id) else {
            return Err(BufferError::CheckpointNotOutstanding(id));
        };
        if checkout.count != token.num_records() {
            state.in_flight.insert(id, checkout);
            return Err(BufferError::InvalidCheckpoint { id });
        }
        state.checked_out -= checkout.count;
        drop(state);

        self.space_available.notify_waiters();
        debug!(checkpoint = %id, records = token.num_records(), "batch checkpointed");
        Ok(())
    }

    fn is_empty(&self) -> bool {
        let mut state = self.lock();
        self.reclaim_expired(&mut state, Instant::now());
        state.queue.is_empty() && state.in_flight.is_empty()
    }

    fn delivery_mode(&self) -> DeliveryMode {
        if self.config.visibility_timeout.is_some() {
            DeliveryMode::AtLeastOnce
        } else {
            DeliveryMode::BestEffort
        }
    }
}
