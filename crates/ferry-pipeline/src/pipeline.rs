use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_ack::AcknowledgementSetManager;
use ferry_buffer::{BlockingBuffer, Buffer, BufferConfig, CircuitBreakingBuffer, DurableBuffer};
use ferry_forward::{HashRing, HttpPeerClient, PeerClient, PeerForwarder, PeerMembership};
use ferry_types::Event;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{PipelineConfig, PluginSetting};
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::plugin::{Processor, Sink, SourceContext};
use crate::registry::PluginRegistry;
use crate::worker::{ProcessWorker, WorkerReport};

/// How long workers get to notice a stop signal once the grace period is over.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// What happened during a pipeline's run, returned by [`Pipeline::shutdown`].
#[derive(Clone, Debug, Default)]
pub struct PipelineReport {
    pub workers: Vec<WorkerReport>,
    /// Workers that had to be aborted.
    pub abandoned_workers: usize,
    pub source_error: Option<String>,
    /// The buffer was empty once the workers stopped.
    pub buffer_drained: bool,
}

impl PipelineReport {
    pub fn events_emitted(&self) -> u64 {
        self.workers.iter().map(|w| w.events_emitted).sum()
    }

    pub fn failed_batches(&self) -> u64 {
        self.workers.iter().map(|w| w.failed_batches).sum()
    }
}

struct Running {
    source_cancel: CancellationToken,
    draining: CancellationToken,
    stop: CancellationToken,
    background: CancellationToken,
    source: JoinHandle<PipelineResult<()>>,
    workers: Vec<JoinHandle<WorkerReport>>,
    forwarders: Vec<Arc<PeerForwarder>>,
    sinks: Vec<Arc<dyn Sink>>,
    background_tasks: Vec<JoinHandle<()>>,
}

/// A source, a buffer, a processor chain, and sinks, run by a pool of
/// workers.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<PluginRegistry>,
    context: PipelineContext,
    buffer: Arc<dyn Buffer<Event>>,
    ack_manager: Option<Arc<AcknowledgementSetManager>>,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    /// Validate `config` against `registry` and open the buffer. Nothing
    /// runs until [`start`](Self::start).
    pub fn new(
        config: PipelineConfig,
        registry: Arc<PluginRegistry>,
        context: PipelineContext,
    ) -> PipelineResult<Self> {
        config.validate()?;
        registry.validate(&config)?;

        let inner: Arc<dyn Buffer<Event>> = match &config.buffer_path {
            Some(path) => Arc::new(DurableBuffer::<Event>::open(
                path,
                config.buffer.clone(),
                config.wal.clone(),
            )?),
            None => Arc::new(BlockingBuffer::<Event>::new(config.buffer.clone())?),
        };
        let buffer: Arc<dyn Buffer<Event>> = Arc::new(CircuitBreakingBuffer::new(
            inner,
            context.circuit_breaker.clone(),
        ));

        let ack_manager = config.acknowledgements.then(|| {
            context
                .ack_manager
                .clone()
                .unwrap_or_else(|| Arc::new(AcknowledgementSetManager::new(config.ack_manager.clone())))
        });

        Ok(Self {
            config,
            registry,
            context,
            buffer,
            ack_manager,
            running: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<dyn Buffer<Event>> {
        &self.buffer
    }

    pub fn ack_manager(&self) -> Option<&Arc<AcknowledgementSetManager>> {
        self.ack_manager.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().expect("pipeline state lock poisoned")
    }

    /// Build every plugin and spawn the source, the workers and the
    /// background monitors. Plugins are built before anything is spawned, so
    /// a factory error leaves nothing running.
    pub fn start(&self) -> PipelineResult<()> {
        let mut running = self.state();
        if running.is_some() {
            return Err(PipelineError::AlreadyStarted(self.config.name.clone()));
        }

        let source = self.registry.build_source(&self.config.source)?;
        let sinks = self
            .config
            .sinks
            .iter()
            .map(|s| self.registry.build_sink(s))
            .collect::<PipelineResult<Vec<_>>>()?;
        let mut per_worker = (0..self.config.workers)
            .map(|_| self.build_processors())
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut stage_forwarders = Vec::with_capacity(self.config.processors.len());
        for (index, setting) in self.config.processors.iter().enumerate() {
            let keys = per_worker[0][index]
                .peer_forwarding()
                .map(|p| p.identification_keys());
            stage_forwarders.push(match keys {
                Some(keys) => Some(self.build_forwarder(index, setting, keys)?),
                None => None,
            });
        }
        let forwarders: Vec<Arc<PeerForwarder>> = stage_forwarders.iter().flatten().cloned().collect();

        let background = CancellationToken::new();
        let mut background_tasks = Vec::new();
        if let Some(manager) = &self.ack_manager {
            background_tasks.push(manager.start_monitor(background.child_token()));
        }
        if let Some(peers) = self.context.peers.as_ref().filter(|_| !forwarders.is_empty()) {
            if let Some((discovery, interval)) = &peers.discovery {
                background_tasks.push(peers.membership.spawn_watcher(
                    discovery.clone(),
                    *interval,
                    background.child_token(),
                ));
            }
        }

        let source_cancel = CancellationToken::new();
        let mut source_ctx =
            SourceContext::new(&self.config.name, self.buffer.clone(), source_cancel.clone());
        if let Some(manager) = &self.ack_manager {
            source_ctx = source_ctx.with_acknowledgements(manager.clone(), self.config.ack_timeout);
        }
        if let Some(coordinator) = &self.context.coordinator {
            source_ctx = source_ctx.with_coordinator(coordinator.clone());
        }
        let source_task = tokio::spawn(async move { source.run(source_ctx).await });

        let draining = CancellationToken::new();
        let stop = CancellationToken::new();
        let workers = per_worker
            .drain(..)
            .enumerate()
            .map(|(id, processors)| {
                let mut worker =
                    ProcessWorker::new(id, &self.config.name, self.buffer.clone(), sinks.clone())
                        .with_read_timeout(self.config.read_timeout)
                        .with_acknowledgements(self.ack_manager.is_some())
                        .with_signals(draining.clone(), stop.clone());
                for (processor, forwarder) in processors.into_iter().zip(&stage_forwarders) {
                    worker = worker.with_stage(processor, forwarder.clone());
                }
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            pipeline = %self.config.name,
            workers = self.config.workers,
            processors = self.config.processors.len(),
            forwarding = forwarders.len(),
            "pipeline started"
        );
        *running = Some(Running {
            source_cancel,
            draining,
            stop,
            background,
            source: source_task,
            workers,
            forwarders,
            sinks,
            background_tasks,
        });
        Ok(())
    }

    fn build_processors(&self) -> PipelineResult<Vec<Box<dyn Processor>>> {
        self.config
            .processors
            .iter()
            .map(|p| self.registry.build_processor(p))
            .collect()
    }

    fn build_forwarder(
        &self,
        index: usize,
        setting: &PluginSetting,
        keys: Vec<String>,
    ) -> PipelineResult<Arc<PeerForwarder>> {
        // Every node runs the same definition, so this id matches across peers.
        let plugin_id = format!("{}/{}/{}", self.config.name, index, setting.name);
        let config = self.config.peer_forwarder.clone();

        let (membership, client) = match &self.context.peers {
            Some(peers) => (peers.membership.clone(), peers.client.clone()),
            None => {
                let ring = HashRing::new([config.local_address.clone()], config.virtual_nodes)?;
                let client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(
                    config.request_timeout,
                    config.auth_token.clone(),
                ));
                (
                    Arc::new(PeerMembership::new(ring, config.local_address.clone())),
                    client,
                )
            }
        };

        // Drained and retired on every forward call, so redelivery is moot.
        let receive: Arc<dyn Buffer<Event>> = Arc::new(BlockingBuffer::<Event>::new(BufferConfig {
            visibility_timeout: None,
            ..self.config.buffer.clone()
        })?);
        // Peer batches are admitted like source writes. Local fallbacks skip
        // the breaker because those events were admitted already.
        let inbound: Arc<dyn Buffer<Event>> = Arc::new(CircuitBreakingBuffer::new(
            receive.clone(),
            self.context.circuit_breaker.clone(),
        ));
        self.context
            .receive_buffers
            .register(plugin_id.clone(), inbound);

        let mut forwarder = PeerForwarder::new(plugin_id, keys, config, membership, client, receive)
            .with_circuit_breaker(self.context.circuit_breaker.clone());
        if let Some(sink) = &self.context.dead_letters {
            forwarder = forwarder.with_dead_letter_sink(sink.clone());
        }
        Ok(Arc::new(forwarder))
    }

    /// Stop the pipeline within roughly `grace`.
    ///
    /// The source is cancelled first, then workers drain the buffer until it
    /// is empty or the grace period runs out, after which they are stopped.
    /// Forwarders, sinks, coordinator leases and background monitors are torn
    /// down last.
    pub async fn shutdown(&self, grace: Duration) -> PipelineResult<PipelineReport> {
        let running = self
            .state()
            .take()
            .ok_or_else(|| PipelineError::NotStarted(self.config.name.clone()))?;
        let name = &self.config.name;
        let deadline = Instant::now() + grace;
        info!(pipeline = %name, grace_ms = grace.as_millis() as u64, "pipeline shutting down");

        running.source_cancel.cancel();
        let mut source = running.source;
        let source_error = match tokio::time::timeout_at(deadline, &mut source).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => {
                error!(pipeline = %name, error = %e, "source failed");
                Some(e.to_string())
            }
            Ok(Err(e)) => {
                error!(pipeline = %name, error = %e, "source task panicked");
                Some(e.to_string())
            }
            Err(_) => {
                source.abort();
                warn!(pipeline = %name, "source ignored cancellation; aborted");
                Some("source did not stop within the grace period".to_string())
            }
        };

        running.draining.cancel();
        let mut report = PipelineReport {
            source_error,
            ..PipelineReport::default()
        };
        for mut worker in running.workers {
            let joined = match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(joined) => joined,
                Err(_) => {
                    running.stop.cancel();
                    match tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut worker).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            worker.abort();
                            report.abandoned_workers += 1;
                            continue;
                        }
                    }
                }
            };
            match joined {
                Ok(worker_report) => report.workers.push(worker_report),
                Err(e) => {
                    error!(pipeline = %name, error = %e, "worker panicked");
                    report.abandoned_workers += 1;
                }
            }
        }

        report.buffer_drained = self.buffer.is_empty();
        if !report.buffer_drained {
            warn!(pipeline = %name, "records left in buffer at shutdown");
        }

        for forwarder in &running.forwarders {
            forwarder.shutdown().await;
            self.context.receive_buffers.remove(forwarder.plugin_id());
        }
        for sink in &running.sinks {
            sink.shutdown().await;
        }
        if let Some(coordinator) = &self.context.coordinator {
            if let Err(e) = coordinator.give_up_partitions().await {
                warn!(pipeline = %name, error = %e, "failed to give up partitions");
            }
        }

        running.background.cancel();
        for task in running.background_tasks {
            let _ = task.await;
        }
        info!(
            pipeline = %name,
            emitted = report.events_emitted(),
            failed = report.failed_batches(),
            abandoned = report.abandoned_workers,
            "pipeline stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{RequiresPeerForwarding, Source};
    use async_trait::async_trait;
    use ferry_coord::{
        CoordinatorConfig, InMemoryCoordinationStore, LeaseBasedSourceCoordinator, SourceCoordinator,
    };
    use ferry_buffer::BufferError;
    use ferry_server::{FerryServer, ServerConfig};
    use ferry_types::{ManualCircuitBreaker, Record};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type Outcome = Arc<Mutex<Option<bool>>>;

    #[derive(Default)]
    struct Collected {
        events: Mutex<Vec<Event>>,
        attempts: AtomicUsize,
        fail: AtomicBool,
    }

    impl Collected {
        fn len(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    struct CollectSink(Arc<Collected>);

    #[async_trait]
    impl Sink for CollectSink {
        async fn output(&self, events: &[Event]) -> PipelineResult<()> {
            self.0.attempts.fetch_add(1, Ordering::SeqCst);
            if self.0.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::plugin("collect", "downstream unavailable"));
            }
            self.0.events.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    #[derive(Deserialize)]
    struct GeneratorSettings {
        count: usize,
    }

    /// Writes `count` events as one acknowledged cohort, then idles.
    struct Generator {
        count: usize,
        outcome: Outcome,
    }

    #[async_trait]
    impl Source for Generator {
        async fn run(&self, ctx: SourceContext) -> PipelineResult<()> {
            let events = (0..self.count)
                .map(|i| Event::new("log", json!({ "n": i, "user": format!("user-{i}") })))
                .collect::<Result<Vec<_>, _>>()?;

            let outcome = self.outcome.clone();
            let set = ctx.create_ack_set(move |ok| *outcome.lock().unwrap() = Some(ok));
            if let Some(set) = &set {
                for event in &events {
                    set.add_event(event)?;
                }
            }
            ctx.write_all(events, Duration::from_secs(1)).await?;
            if let Some(set) = set {
                set.complete()?;
            }
            ctx.cancelled().await;
            Ok(())
        }
    }

    /// Claims one partition through the coordinator and holds it.
    struct Partitioned {
        claimed: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl Source for Partitioned {
        async fn run(&self, ctx: SourceContext) -> PipelineResult<()> {
            let coordinator = ctx
                .coordinator()
                .cloned()
                .ok_or_else(|| PipelineError::plugin("partitioned", "no coordinator"))?;
            coordinator.create_partition("shard-0", None).await?;
            if let Some(partition) = coordinator.get_next_partition().await? {
                *self.claimed.lock().unwrap() = Some(partition.key().to_string());
            }
            ctx.cancelled().await;
            Ok(())
        }
    }

    struct Keyed {
        forward: bool,
    }

    #[async_trait]
    impl Processor for Keyed {
        async fn execute(&mut self, mut events: Vec<Event>) -> PipelineResult<Vec<Event>> {
            for event in &mut events {
                event.metadata_mut().add_tags(["seen"]);
            }
            Ok(events)
        }

        fn peer_forwarding(&self) -> Option<&dyn RequiresPeerForwarding> {
            self.forward.then_some(self as &dyn RequiresPeerForwarding)
        }
    }

    impl RequiresPeerForwarding for Keyed {
        fn identification_keys(&self) -> Vec<String> {
            vec!["user".into()]
        }
    }

    struct Fixture {
        collected: Arc<Collected>,
        outcome: Outcome,
        claimed: Arc<Mutex<Option<String>>>,
        registry: Arc<PluginRegistry>,
    }

    fn fixture() -> Fixture {
        let collected = Arc::new(Collected::default());
        let outcome: Outcome = Arc::default();
        let claimed: Arc<Mutex<Option<String>>> = Arc::default();

        let mut registry = PluginRegistry::new();
        let gen_outcome = outcome.clone();
        let part_claimed = claimed.clone();
        let sink_state = collected.clone();
        registry
            .register_source("generator", move |setting| {
                let settings: GeneratorSettings = setting.parse()?;
                Ok(Arc::new(Generator {
                    count: settings.count,
                    outcome: gen_outcome.clone(),
                }) as Arc<dyn Source>)
            })
            .register_source("partitioned", move |_| {
                Ok(Arc::new(Partitioned {
                    claimed: part_claimed.clone(),
                }) as Arc<dyn Source>)
            })
            .register_processor("tag", |_| Ok(Box::new(Keyed { forward: false }) as Box<dyn Processor>))
            .register_processor("keyed", |_| Ok(Box::new(Keyed { forward: true }) as Box<dyn Processor>))
            .register_sink("collect", move |_| {
                Ok(Arc::new(CollectSink(sink_state.clone())) as Arc<dyn Sink>)
            });

        Fixture {
            collected,
            outcome,
            claimed,
            registry: Arc::new(registry),
        }
    }

    fn config(count: usize, processors: &[&str]) -> PipelineConfig {
        let mut config = PipelineConfig::new(
            "p",
            PluginSetting::new("generator").with_settings(json!({ "count": count })),
            vec![PluginSetting::new("collect")],
        );
        config.read_timeout = Duration::from_millis(50);
        config.processors = processors.iter().map(|p| PluginSetting::new(*p)).collect();
        config
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn events_flow_from_source_through_processors_to_sinks() {
        let f = fixture();
        let mut config = config(20, &["tag"]);
        config.workers = 3;
        let pipeline = Pipeline::new(config, f.registry.clone(), PipelineContext::new()).unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.is_running());

        wait_until(|| f.collected.len() == 20).await;
        let report = pipeline.shutdown(Duration::from_secs(2)).await.unwrap();

        assert!(!pipeline.is_running());
        assert_eq!(report.workers.len(), 3);
        assert_eq!(report.events_emitted(), 20);
        assert_eq!(report.abandoned_workers, 0);
        assert!(report.source_error.is_none());
        assert!(report.buffer_drained);
        assert!(f
            .collected
            .events
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.metadata().has_tags(&["seen"])));
    }

    #[tokio::test]
    async fn acknowledgement_set_completes_after_sinks() {
        let f = fixture();
        let mut config = config(5, &["tag"]);
        config.acknowledgements = true;
        let pipeline = Pipeline::new(config, f.registry.clone(), PipelineContext::new()).unwrap();
        assert!(pipeline.ack_manager().is_some());
        pipeline.start().unwrap();

        wait_until(|| f.outcome.lock().unwrap().is_some()).await;
        assert_eq!(*f.outcome.lock().unwrap(), Some(true));
        assert_eq!(f.collected.len(), 5);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn sink_failure_fails_the_acknowledgement_set() {
        let f = fixture();
        f.collected.fail.store(true, Ordering::SeqCst);
        let mut config = config(4, &[]);
        config.acknowledgements = true;
        let pipeline = Pipeline::new(config, f.registry.clone(), PipelineContext::new()).unwrap();
        pipeline.start().unwrap();

        wait_until(|| f.outcome.lock().unwrap().is_some()).await;
        assert_eq!(*f.outcome.lock().unwrap(), Some(false));

        let report = pipeline.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(report.failed_batches() >= 1);
        assert!(!report.buffer_drained);
        assert_eq!(report.abandoned_workers, 0);
    }

    #[test]
    fn unknown_plugins_fail_construction() {
        let f = fixture();
        let config = config(1, &["grok"]);
        match Pipeline::new(config, f.registry, PipelineContext::new()) {
            Err(PipelineError::UnknownPlugin { name, .. }) => assert_eq!(name, "grok"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("pipeline built with an unknown processor"),
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_are_not_repeatable() {
        let f = fixture();
        let pipeline = Pipeline::new(config(0, &[]), f.registry.clone(), PipelineContext::new()).unwrap();
        assert!(matches!(
            pipeline.shutdown(Duration::ZERO).await,
            Err(PipelineError::NotStarted(_))
        ));

        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyStarted(_))));
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            pipeline.shutdown(Duration::from_secs(1)).await,
            Err(PipelineError::NotStarted(_))
        ));
    }

    #[tokio::test]
    async fn forwarding_processor_on_a_single_node_stays_local() {
        let f = fixture();
        let context = PipelineContext::new();
        let pipeline = Pipeline::new(config(9, &["keyed"]), f.registry.clone(), context.clone()).unwrap();
        pipeline.start().unwrap();
        assert_eq!(context.receive_buffers().plugin_ids(), vec!["p/0/keyed".to_string()]);

        wait_until(|| f.collected.len() == 9).await;
        let report = pipeline.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(report.events_emitted(), 9);
        assert!(context.receive_buffers().plugin_ids().is_empty());
    }

    #[tokio::test]
    async fn durable_buffer_replays_unfinished_records_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.wal");

        let first = fixture();
        first.collected.fail.store(true, Ordering::SeqCst);
        let mut config1 = config(5, &[]);
        config1.buffer_path = Some(path.clone());
        let pipeline = Pipeline::new(config1, first.registry.clone(), PipelineContext::new()).unwrap();
        pipeline.start().unwrap();
        wait_until(|| first.collected.attempts.load(Ordering::SeqCst) >= 1).await;
        pipeline.shutdown(Duration::from_millis(50)).await.unwrap();
        drop(pipeline);

        let second = fixture();
        let mut config2 = config(0, &[]);
        config2.buffer_path = Some(path);
        let pipeline = Pipeline::new(config2, second.registry.clone(), PipelineContext::new()).unwrap();
        pipeline.start().unwrap();
        wait_until(|| second.collected.len() == 5).await;
        let report = pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(report.buffer_drained);
    }

    #[tokio::test]
    async fn partition_leases_are_given_up_on_shutdown() {
        let f = fixture();
        let store = Arc::new(InMemoryCoordinationStore::new());
        let node_a = Arc::new(LeaseBasedSourceCoordinator::new(
            "p",
            "node-a",
            store.clone(),
            CoordinatorConfig::default(),
        ));
        let node_b = LeaseBasedSourceCoordinator::new("p", "node-b", store, CoordinatorConfig::default());

        let mut config = config(0, &[]);
        config.source = PluginSetting::new("partitioned");
        let pipeline = Pipeline::new(
            config,
            f.registry.clone(),
            PipelineContext::new().with_coordinator(node_a),
        )
        .unwrap();
        pipeline.start().unwrap();

        wait_until(|| f.claimed.lock().unwrap().is_some()).await;
        assert!(node_b.get_next_partition().await.unwrap().is_none());

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        let partition = node_b.get_next_partition().await.unwrap().unwrap();
        assert_eq!(partition.key(), "shard-0");
    }

    #[tokio::test]
    async fn open_circuit_rejects_source_writes() {
        let f = fixture();
        let breaker = Arc::new(ManualCircuitBreaker::new());
        breaker.trip();
        let pipeline = Pipeline::new(
            config(3, &[]),
            f.registry.clone(),
            PipelineContext::new().with_circuit_breaker(breaker),
        )
        .unwrap();
        pipeline.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(report.source_error.unwrap().contains("circuit breaker is open"));
        assert_eq!(f.collected.len(), 0);
    }

    #[tokio::test]
    async fn open_circuit_rejects_forwarded_batches() {
        let f = fixture();
        let breaker = Arc::new(ManualCircuitBreaker::new());
        let context = PipelineContext::new().with_circuit_breaker(breaker.clone());
        let pipeline = Pipeline::new(config(0, &["keyed"]), f.registry.clone(), context.clone()).unwrap();
        pipeline.start().unwrap();

        let receive = context.receive_buffers().get("p/0/keyed").unwrap();
        let event = || Record::new(Event::new("log", json!({"user": "u"})).unwrap());
        breaker.trip();
        assert!(matches!(
            receive.write_all(vec![event()], Duration::from_millis(50)).await,
            Err(BufferError::CircuitOpen)
        ));

        breaker.reset();
        receive.write_all(vec![event()], Duration::from_millis(50)).await.unwrap();
        wait_until(|| f.collected.len() == 1).await;
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn keyed_events_reach_the_owning_node() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap().to_string();
        let local_addr = "127.0.0.1:1".to_string();
        let ring = HashRing::with_default_vnodes([local_addr.clone(), remote_addr.clone()]).unwrap();
        let client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(Duration::from_secs(5), None));

        let remote = fixture();
        let remote_context = PipelineContext::new().with_peers(
            Arc::new(PeerMembership::new(ring.clone(), remote_addr.clone())),
            client.clone(),
        );
        let remote_pipeline =
            Pipeline::new(config(0, &["keyed"]), remote.registry.clone(), remote_context.clone()).unwrap();
        remote_pipeline.start().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(
            FerryServer::new(ServerConfig::default(), remote_context.receive_buffers().clone())
                .serve_on(listener, cancel.clone()),
        );

        let local = fixture();
        let local_context = PipelineContext::new().with_peers(
            Arc::new(PeerMembership::new(ring.clone(), local_addr.clone())),
            client,
        );
        let local_pipeline =
            Pipeline::new(config(40, &["keyed"]), local.registry.clone(), local_context).unwrap();
        local_pipeline.start().unwrap();

        wait_until(|| local.collected.len() + remote.collected.len() == 40).await;
        let local_report = local_pipeline.shutdown(Duration::from_secs(2)).await.unwrap();
        remote_pipeline.shutdown(Duration::from_secs(2)).await.unwrap();
        cancel.cancel();
        server.await.unwrap().unwrap();

        let owner = |e: &Event| ring.owner_for_values(&[e.get("user")]).map(str::to_string);
        let here = local.collected.events.lock().unwrap().clone();
        let there = remote.collected.events.lock().unwrap().clone();
        assert!(!there.is_empty());
        assert!(here.iter().all(|e| owner(e).as_deref() == Some(local_addr.as_str())));
        assert!(there.iter().all(|e| owner(e).as_deref() == Some(remote_addr.as_str())));
        assert!(there.iter().all(|e| e.metadata().has_tags(&["seen"])));
        assert_eq!(local_report.events_emitted() as usize, here.len());
    }
}
