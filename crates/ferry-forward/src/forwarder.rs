use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ferry_buffer::Buffer;
use ferry_types::{
    CircuitBreaker, DeadLetterRecord, DeadLetterSink, Event, NeverOpen, Record,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::PeerClient;
use crate::config::{ForwarderConfig, ForwardingFailurePolicy};
use crate::discovery::PeerMembership;
use crate::error::{ForwardError, ForwardResult};
use crate::ring::hash_identification_values;
use crate::wire::WireBatch;

/// State shared by the forwarder and its per-peer sender tasks.
struct Shared {
    plugin_id: String,
    config: ForwarderConfig,
    client: Arc<dyn PeerClient>,
    receive_buffer: Arc<dyn Buffer<Event>>,
    dead_letters: RwLock<Option<Arc<dyn DeadLetterSink>>>,
    in_flight: AtomicUsize,
}

impl Shared {
    /// Send one batch with retries, then apply the failure policy.
    async fn deliver(&self, peer: &str, events: Vec<Event>) {
        let batch = WireBatch::new(&self.plugin_id, &events);
        let mut delay = self.config.retry_backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.client.send(peer, &batch).await {
                Ok(()) => {
                    for event in &events {
                        event.handle().release(true);
                    }
                    debug!(plugin = %self.plugin_id, peer = %peer, count = events.len(), "events forwarded");
                    break;
                }
                Err(e) if attempt <= self.config.max_retries => {
                    warn!(peer = %peer, attempt, error = %e, "peer forward failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    let exhausted = ForwardError::RetriesExhausted {
                        peer: peer.to_string(),
                        attempts: attempt,
                    };
                    error!(peer = %peer, count = events.len(), last_error = %e, "{exhausted}");
                    let count = events.len();
                    self.fall_back(events, &exhausted.to_string()).await;
                    self.in_flight.fetch_sub(count, Ordering::SeqCst);
                    return;
                }
            }
        }
        self.in_flight.fetch_sub(events.len(), Ordering::SeqCst);
    }

    /// Failure policy for events that already left the worker.
    async fn fall_back(&self, events: Vec<Event>, reason: &str) {
        match self.config.failure_policy {
            ForwardingFailurePolicy::ProcessLocally => {
                let records = events.iter().cloned().map(Record::new).collect();
                match self
                    .receive_buffer
                    .write_all(records, self.config.local_write_timeout)
                    .await
                {
                    Ok(()) => warn!(
                        plugin = %self.plugin_id,
                        count = events.len(),
                        reason,
                        "processing undeliverable events locally"
                    ),
                    Err(e) => {
                        error!(plugin = %self.plugin_id, error = %e, "local fallback write failed");
                        self.dead_letter(events, reason).await;
                    }
                }
            }
            ForwardingFailurePolicy::DeadLetter => self.dead_letter(events, reason).await,
        }
    }

    async fn dead_letter(&self, events: Vec<Event>, reason: &str) {
        let sink = self
            .dead_letters
            .read()
            .expect("dead-letter lock poisoned")
            .clone();
        let Some(sink) = sink else {
            error!(
                plugin = %self.plugin_id,
                count = events.len(),
                reason,
                "no dead-letter sink configured; failing events"
            );
            release_all(&events, false);
            return;
        };

        let records = events
            .iter()
            .map(|e| DeadLetterRecord::new(e.clone(), &self.plugin_id, reason))
            .collect();
        match sink.write(records).await {
            Ok(()) => {
                warn!(plugin = %self.plugin_id, count = events.len(), reason, "events dead-lettered");
                release_all(&events, true);
            }
            Err(e) => {
                error!(plugin = %self.plugin_id, count = events.len(), error = %e, "dead-letter write failed");
                release_all(&events, false);
            }
        }
    }
}

fn release_all(events: &[Event], positive: bool) {
    for event in events {
        event.handle().release(positive);
    }
}

/// Routes events to the peer that owns their identification keys.
///
/// One sender task per remote peer batches and ships events, so a slow
/// peer only backs up its own queue. `forward` never waits on the network.
pub struct PeerForwarder {
    identification_keys: Vec<String>,
    membership: Arc<PeerMembership>,
    breaker: Arc<dyn CircuitBreaker>,
    shared: Arc<Shared>,
    senders: Mutex<HashMap<String, mpsc::Sender<Event>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerForwarder {
    pub fn new(
        plugin_id: impl Into<String>,
        identification_keys: Vec<String>,
        config: ForwarderConfig,
        membership: Arc<PeerMembership>,
        client: Arc<dyn PeerClient>,
        receive_buffer: Arc<dyn Buffer<Event>>,
    ) -> Self {
        Self {
            identification_keys,
            membership,
            breaker: Arc::new(NeverOpen),
            shared: Arc::new(Shared {
                plugin_id: plugin_id.into(),
                config,
                client,
                receive_buffer,
                dead_letters: RwLock::new(None),
                in_flight: AtomicUsize::new(0),
            }),
            senders: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_dead_letter_sink(self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.set_dead_letter_sink(sink);
        self
    }

    /// Route undeliverable events to `sink`. Takes effect for sender tasks
    /// that are already running.
    pub fn set_dead_letter_sink(&self, sink: Arc<dyn DeadLetterSink>) {
        *self
            .shared
            .dead_letters
            .write()
            .expect("dead-letter lock poisoned") = Some(sink);
    }

    pub fn plugin_id(&self) -> &str {
        &self.shared.plugin_id
    }

    /// Events queued for or being sent to peers.
    pub fn pending_forwards(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Nothing queued for peers and nothing received from them.
    pub fn is_idle(&self) -> bool {
        self.pending_forwards() == 0 && self.shared.receive_buffer.is_empty()
    }

    /// Split `events` by owner. Returns the events to process on this node:
    /// the locally owned ones, any the failure policy kept here, and whatever
    /// peers have forwarded to us since the last call.
    pub async fn forward(&self, events: Vec<Event>) -> ForwardResult<Vec<Event>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForwardError::ShutDown);
        }

        let ring = self.membership.ring();
        let mut local = Vec::new();
        let mut rejected = Vec::new();
        let mut remote = 0;
        for event in events {
            let values: Vec<_> = self
                .identification_keys
                .iter()
                .map(|key| event.get(key))
                .collect();
            let owner = ring
                .owner(hash_identification_values(&values))
                .ok_or(ForwardError::NoPeers)?;
            if self.membership.is_local(owner) {
                local.push(event);
                continue;
            }
            if self.breaker.is_open() {
                rejected.push(event);
                continue;
            }

            match self.sender(owner).try_send(event) {
                Ok(()) => {
                    self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    remote += 1;
                }
                Err(TrySendError::Full(event) | TrySendError::Closed(event)) => {
                    rejected.push(event);
                }
            }
        }

        if !rejected.is_empty() {
            let reason = if self.breaker.is_open() {
                ForwardError::CircuitOpen.to_string()
            } else {
                "peer send queue full".to_string()
            };
            match self.shared.config.failure_policy {
                ForwardingFailurePolicy::ProcessLocally => {
                    warn!(plugin = %self.plugin_id(), count = rejected.len(), reason = %reason, "processing events locally");
                    local.extend(rejected);
                }
                ForwardingFailurePolicy::DeadLetter => {
                    self.shared.dead_letter(rejected, &reason).await
                }
            }
        }
        if remote > 0 {
            debug!(plugin = %self.plugin_id(), remote, local = local.len(), "events routed");
        }

        local.extend(self.drain_received().await?);
        Ok(local)
    }

    /// Take what peers sent us. Forwarded events are not persisted, so the
    /// batch is retired as soon as it is handed to the worker.
    async fn drain_received(&self) -> ForwardResult<Vec<Event>> {
        let buffer = &self.shared.receive_buffer;
        let (records, token) = buffer.read(Duration::ZERO).await?;
        buffer.checkpoint(token)?;
        Ok(records.into_iter().map(Record::into_data).collect())
    }

    fn sender(&self, peer: &str) -> mpsc::Sender<Event> {
        let mut senders = self.senders.lock().expect("sender map lock poisoned");
        if let Some(tx) = senders.get(peer) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.shared.config.sender_queue_capacity.max(1));
        let task = tokio::spawn(run_sender(peer.to_string(), rx, self.shared.clone()));
        self.tasks.lock().expect("sender task lock poisoned").push(task);
        senders.insert(peer.to_string(), tx.clone());
        debug!(plugin = %self.plugin_id(), peer = %peer, "peer sender started");
        tx
    }

    /// Stop accepting events and flush queued forwards for up to the
    /// configured drain timeout. Anything still unsent is abandoned and logged.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders closes every queue; tasks exit once drained.
        self.senders.lock().expect("sender map lock poisoned").clear();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("sender task lock poisoned"));

        let deadline = Instant::now() + self.shared.config.drain_timeout;
        let mut abandoned_tasks = 0;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                abandoned_tasks += 1;
            }
        }

        let abandoned = self.shared.in_flight.swap(0, Ordering::SeqCst);
        if abandoned > 0 || abandoned_tasks > 0 {
            error!(
                plugin = %self.plugin_id(),
                abandoned,
                peers = abandoned_tasks,
                "abandoned in-flight forwards at shutdown"
            );
        } else {
            info!(plugin = %self.plugin_id(), "peer forwarder drained");
        }
    }
}

async fn run_sender(peer: String, mut rx: mpsc::Receiver<Event>, shared: Arc<Shared>) {
    let batch_size = shared.config.batch_size.max(1);
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + shared.config.batch_timeout;
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                Ok(None) | Err(_) => break,
            }
        }
        shared.deliver(&peer, batch).await;
    }
    debug!(peer = %peer, "peer sender stopped");
}
