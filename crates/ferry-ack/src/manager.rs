use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::set::{AckSetId, AcknowledgementSet};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AckManagerConfig {
    /// How often the monitor looks for expired sets.
    pub sweep_interval: Duration,
}

impl Default for AckManagerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Creates acknowledgement sets and expires the ones that outlive their
/// timeout.
///
/// The registry lock is only held to insert, snapshot, or prune; expiry
/// itself takes each set's own lock, so the sweep never blocks releases
/// on unrelated sets.
pub struct AcknowledgementSetManager {
    config: AckManagerConfig,
    sets: RwLock<HashMap<AckSetId, AcknowledgementSet>>,
}

impl AcknowledgementSetManager {
    pub fn new(config: AckManagerConfig) -> Self {
        Self {
            config,
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Create a set that fires `callback` once, failing it after `timeout`.
    pub fn create<F>(&self, callback: F, timeout: Duration) -> AcknowledgementSet
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let set = AcknowledgementSet::new(Box::new(callback), timeout);
        self.sets
            .write()
            .expect("ack registry lock poisoned")
            .insert(set.id(), set.clone());
        debug!(set = %set.id(), timeout_ms = timeout.as_millis() as u64, "acknowledgement set created");
        set
    }

    /// Expire overdue sets and forget terminal ones. Returns how many sets
    /// this sweep expired.
    pub fn sweep(&self) -> usize {
        let snapshot: Vec<AcknowledgementSet> = self
            .sets
            .read()
            .expect("ack registry lock poisoned")
            .values()
            .cloned()
            .collect();

        let now = Instant::now();
        let mut expired = 0;
        let mut finished = Vec::new();
        for set in snapshot {
            if set.expire_if_due(now) {
                expired += 1;
            }
            if set.status().is_terminal() {
                finished.push(set.id());
            }
        }

        if !finished.is_empty() {
            let mut sets = self.sets.write().expect("ack registry lock poisoned");
            for id in &finished {
                sets.remove(id);
            }
        }
        if expired > 0 {
            info!(expired, pruned = finished.len(), "acknowledgement sweep");
        }
        expired
    }

    /// Sets not yet pruned by a sweep.
    pub fn outstanding(&self) -> usize {
        self.sets.read().expect("ack registry lock poisoned").len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `cancel` fires.
    pub fn start_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                }
            }
            debug!("acknowledgement monitor stopped");
        })
    }
}

impl Default for AcknowledgementSetManager {
    fn default() -> Self {
        Self::new(AckManagerConfig::default())
    }
}
