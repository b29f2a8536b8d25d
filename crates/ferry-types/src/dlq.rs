use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::event::Event;

/// An event that could not be delivered, with the reason it was given up on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event: Event,
    /// Plugin that was handling the event when it failed.
    pub plugin_id: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(event: Event, plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event,
            plugin_id: plugin_id.into(),
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Fallback destination for records that exhausted their retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, records: Vec<DeadLetterRecord>) -> Result<(), TypeError>;
}

/// Dead-letter sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().expect("dlq lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("dlq lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn write(&self, records: Vec<DeadLetterRecord>) -> Result<(), TypeError> {
        self.records
            .lock()
            .expect("dlq lock poisoned")
            .extend(records);
        Ok(())
    }
}
