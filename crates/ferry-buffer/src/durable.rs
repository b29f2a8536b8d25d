use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ferry_types::Record;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blocking::{BlockingBuffer, BufferConfig};
use crate::checkpoint::{CheckpointId, CheckpointState};
use crate::error::{BufferError, BufferResult};
use crate::traits::{Buffer, DeliveryMode};
use crate::wal::{WalConfig, WriteAheadLog};

/// Payloads are JSON inside the bincode frame so self-describing values
/// (such as event bodies) survive the round trip.
#[derive(Debug, Serialize, Deserialize)]
enum LogEntry {
    Write { seq: u64, payload: Vec<u8> },
    Retire { seqs: Vec<u64> },
}

#[derive(Clone)]
struct Sequenced<T> {
    seq: u64,
    data: T,
}

/// Decrements the admission counter even if the write future is dropped.
struct AdmitGuard<'a>(&'a AtomicUsize);

impl<'a> AdmitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AdmitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`BlockingBuffer`] whose contents survive a restart.
///
/// Every admitted record is logged before it becomes readable, and every
/// checkpoint logs the retirement of its records. Reopening the log replays
/// whatever was written but never retired, so those records are delivered
/// again. Opening rewrites the log down to those records, and it is
/// compacted again whenever the buffer drains completely.
pub struct DurableBuffer<T> {
    inner: BlockingBuffer<Sequenced<T>>,
    wal: WriteAheadLog,
    next_seq: AtomicU64,
    outstanding: Mutex<HashMap<CheckpointId, Vec<u64>>>,
    admitting: AtomicUsize,
}

impl<T> DurableBuffer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open the buffer, replaying any unretired records from `path`.
    pub fn open(path: &Path, config: BufferConfig, wal_config: WalConfig) -> BufferResult<Self> {
        let wal = WriteAheadLog::open(path, wal_config)?;

        let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let mut max_seq = None;
        for entry in wal.recover::<LogEntry>()? {
            match entry {
                LogEntry::Write { seq, payload } => {
                    max_seq = max_seq.max(Some(seq));
                    pending.insert(seq, payload);
                }
                LogEntry::Retire { seqs } => {
                    for seq in seqs {
                        pending.remove(&seq);
                    }
                }
            }
        }

        let mut replay = Vec::with_capacity(pending.len());
        for (seq, payload) in pending {
            match serde_json::from_slice::<T>(&payload) {
                Ok(data) => replay.push((seq, payload, data)),
                Err(e) => warn!(seq, error = %e, "undecodable buffered record; dropping"),
            }
        }
        if replay.len() > config.capacity {
            return Err(BufferError::CapacityExceeded {
                requested: replay.len(),
                capacity: config.capacity,
            });
        }

        let survivors: Vec<LogEntry> = replay
            .iter()
            .map(|(seq, payload, _)| LogEntry::Write {
                seq: *seq,
                payload: payload.clone(),
            })
            .collect();
        wal.rewrite(&survivors)?;

        let inner = BlockingBuffer::new(config)?;
        let recovered = replay.len();
        inner.preload(
            replay
                .into_iter()
                .map(|(seq, _, data)| Record::new(Sequenced { seq, data }))
                .collect(),
        );

        info!(path = %path.display(), recovered, "durable buffer opened");
        Ok(Self {
            inner,
            wal,
            next_seq: AtomicU64::new(max_seq.map_or(0, |s| s + 1)),
            outstanding: Mutex::new(HashMap::new()),
            admitting: AtomicUsize::new(0),
        })
    }

    /// Current size of the backing log in bytes.
    pub fn log_offset(&self) -> u64 {
        self.wal.offset()
    }

    async fn log_and_admit(&self, records: Vec<Record<T>>, timeout: Duration) -> BufferResult<()> {
        let mut payloads = Vec::with_capacity(records.len());
        for record in &records {
            payloads.push(
                serde_json::to_vec(record.data())
                    .map_err(|e| BufferError::Serialization(e.to_string()))?,
            );
        }

        let mut seqs = Vec::with_capacity(records.len());
        let mut stamped = Vec::with_capacity(records.len());
        for (record, payload) in records.into_iter().zip(payloads) {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.wal.append(&LogEntry::Write { seq, payload }) {
                self.abandon(seqs);
                return Err(e);
            }
            seqs.push(seq);
            stamped.push(Record::new(Sequenced {
                seq,
                data: record.into_data(),
            }));
        }

        match self.inner.write_all(stamped, timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abandon(seqs);
                Err(e)
            }
        }
    }

    /// Retire logged records that were never admitted.
    fn abandon(&self, seqs: Vec<u64>) {
        if seqs.is_empty() {
            return;
        }
        if let Err(e) = self.wal.append(&LogEntry::Retire { seqs }) {
            warn!(error = %e, "failed to log abandoned write; records may replay after restart");
        }
    }

    fn maybe_compact(&self) -> BufferResult<()> {
        let offset = self.wal.offset();
        if self.admitting.load(Ordering::SeqCst) == 0
            && self.inner.is_empty()
            && self.wal.truncate_if_offset(offset)?
        {
            debug!(path = %self.wal.path().display(), "durable buffer log compacted");
        }
        Ok(())
    }
}

#[async_trait]
impl<T> Buffer<T> for DurableBuffer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn write(&self, record: Record<T>, timeout: Duration) -> BufferResult<()> {
        self.write_all(vec![record], timeout).await
    }

    async fn write_all(&self, records: Vec<Record<T>>, timeout: Duration) -> BufferResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let capacity = self.inner.config().capacity;
        if records.len() > capacity {
            return Err(BufferError::CapacityExceeded {
                requested: records.len(),
                capacity,
            });
        }

        let _guard = AdmitGuard::enter(&self.admitting);
        self.log_and_admit(records, timeout).await
    }

    async fn read(&self, timeout: Duration) -> BufferResult<(Vec<Record<T>>, CheckpointState)> {
        let (records, token) = self.inner.read(timeout).await?;
        let (live, issued) = self.inner.outstanding_checkpoints();
        let mut outstanding = self.outstanding.lock().expect("outstanding lock poisoned");
        // Tokens the inner buffer reclaimed will never be checkpointed.
        outstanding.retain(|id, _| id.as_u64() >= issued || live.contains(id));
        if !token.is_empty() {
            let seqs = records.iter().map(|r| r.data().seq).collect();
            outstanding.insert(token.id(), seqs);
        }
        drop(outstanding);
        let records = records
            .into_iter()
            .map(|r| Record::new(r.into_data().data))
            .collect();
        Ok((records, token))
    }

    fn checkpoint(&self, token: CheckpointState) -> BufferResult<()> {
        let id = token.id();
        match self.inner.checkpoint(token) {
            Ok(()) => {}
            Err(e @ BufferError::CheckpointNotOutstanding(_)) => {
                self.outstanding
                    .lock()
                    .expect("outstanding lock poisoned")
                    .remove(&id);
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let seqs = self
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .remove(&id);
        if let Some(seqs) = seqs {
            self.wal.append(&LogEntry::Retire { seqs })?;
        }
        self.maybe_compact()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.inner.delivery_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::Event;
    use serde_json::json;

    const WAIT: Duration = Duration::from_millis(200);

    fn open<T>(dir: &tempfile::TempDir, config: BufferConfig) -> DurableBuffer<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        DurableBuffer::open(&dir.path().join("buffer.wal"), config, WalConfig::default()).unwrap()
    }

    fn strings(values: &[&str]) -> Vec<Record<String>> {
        values.iter().map(|v| Record::new(v.to_string())).collect()
    }

    #[tokio::test]
    async fn unread_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let buf = open::<String>(&dir, BufferConfig::default());
        buf.write_all(strings(&["a", "b", "c"]), WAIT).await.unwrap();
        drop(buf);

        let buf = open::<String>(&dir, BufferConfig::default());
        let (batch, _) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch, strings(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn checkpointed_records_do_not_replay() {
        let dir = tempfile::tempdir().unwrap();
        let buf = open::<String>(&dir, BufferConfig::default());
        buf.write_all(strings(&["a", "b"]), WAIT).await.unwrap();
        let (_, token) = buf.read(WAIT).await.unwrap();
        buf.checkpoint(token).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.log_offset(), 0);
        drop(buf);

        let buf = open::<String>(&dir, BufferConfig::default());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn unretired_checkout_replays_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let buf = open::<String>(&dir, BufferConfig::default());
        buf.write_all(strings(&["x", "y"]), WAIT).await.unwrap();
        let (batch, _token) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch.len(), 2);
        drop(buf);

        let buf = open::<String>(&dir, BufferConfig::default());
        let (batch, _) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch, strings(&["x", "y"]));
    }

    #[tokio::test]
    async fn partial_checkpoint_keeps_remaining_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferConfig {
            batch_size: 2,
            ..BufferConfig::default()
        };
        let buf = open::<String>(&dir, config.clone());
        buf.write_all(strings(&["1", "2", "3", "4"]), WAIT)
            .await
            .unwrap();
        let (_, token) = buf.read(WAIT).await.unwrap();
        buf.checkpoint(token).unwrap();
        drop(buf);

        let buf = open::<String>(&dir, config);
        let (batch, token) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch, strings(&["3", "4"]));

        // New writes after replay continue the sequence without clobbering.
        buf.write(Record::new("5".to_string()), WAIT).await.unwrap();
        buf.checkpoint(token).unwrap();
        drop(buf);

        let buf = open::<String>(&dir, BufferConfig::default());
        let (batch, _) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch, strings(&["5"]));
    }

    #[tokio::test]
    async fn events_round_trip_through_log() {
        let dir = tempfile::tempdir().unwrap();
        let event = Event::new("log", json!({"msg": "hello", "n": [1, 2]})).unwrap();
        let buf = open::<Event>(&dir, BufferConfig::default());
        buf.write(Record::new(event.clone()), WAIT).await.unwrap();
        drop(buf);

        let buf = open::<Event>(&dir, BufferConfig::default());
        let (batch, _) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch[0].data(), &event);
    }

    #[tokio::test]
    async fn timed_out_write_is_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferConfig {
            capacity: 1,
            ..BufferConfig::default()
        };
        let buf = open::<String>(&dir, config.clone());
        buf.write(Record::new("kept".to_string()), WAIT).await.unwrap();
        let err = buf
            .write(Record::new("rejected".to_string()), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BufferError::WriteTimeout { .. }));
        drop(buf);

        let buf = open::<String>(&dir, config);
        let (batch, _) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch, strings(&["kept"]));
    }

    #[tokio::test]
    async fn failed_recovery_rewrite_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let buf = open::<String>(&dir, BufferConfig::default());
        buf.write_all(strings(&["a", "b"]), WAIT).await.unwrap();
        drop(buf);

        let staging = dir.path().join("buffer.wal.compact");
        std::fs::create_dir(&staging).unwrap();
        let err = DurableBuffer::<String>::open(
            &dir.path().join("buffer.wal"),
            BufferConfig::default(),
            WalConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BufferError::Io(_)));

        std::fs::remove_dir(&staging).unwrap();
        let buf = open::<String>(&dir, BufferConfig::default());
        let (batch, _) = buf.read(WAIT).await.unwrap();
        assert_eq!(batch, strings(&["a", "b"]));
    }

    #[tokio::test]
    async fn redelivered_batches_do_not_leak_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferConfig {
            visibility_timeout: Some(Duration::from_millis(20)),
            ..BufferConfig::default()
        };
        let buf = open::<String>(&dir, config.clone());
        buf.write(Record::new("retry".to_string()), WAIT).await.unwrap();

        let mut token = None;
        for _ in 0..5 {
            let (batch, next) = buf.read(WAIT).await.unwrap();
            assert_eq!(batch, strings(&["retry"]));
            token = Some(next);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        let (_, last) = buf.read(WAIT).await.unwrap();
        assert_eq!(buf.outstanding.lock().unwrap().len(), 1);

        assert!(matches!(
            buf.checkpoint(token.unwrap()),
            Err(BufferError::CheckpointNotOutstanding(_))
        ));
        buf.checkpoint(last).unwrap();
        assert!(buf.outstanding.lock().unwrap().is_empty());
        drop(buf);

        let buf = open::<String>(&dir, config);
        assert!(buf.is_empty());
    }
}
