use std::sync::Arc;
use std::time::Duration;

use ferry_ack::AcknowledgementSetManager;
use ferry_coord::SourceCoordinator;
use ferry_forward::{PeerClient, PeerDiscovery, PeerMembership, ReceiveBufferRegistry};
use ferry_types::{CircuitBreaker, DeadLetterSink, NeverOpen};

/// Shared collaborators of one pipeline, handed to it at construction.
///
/// Everything here outlives individual workers and is torn down by
/// [`Pipeline::shutdown`](crate::Pipeline::shutdown). Unset pieces fall back
/// to single-node defaults: no peers, no dead-letter sink, a breaker that
/// never opens.
#[derive(Clone)]
pub struct PipelineContext {
    pub(crate) circuit_breaker: Arc<dyn CircuitBreaker>,
    pub(crate) dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub(crate) ack_manager: Option<Arc<AcknowledgementSetManager>>,
    pub(crate) coordinator: Option<Arc<dyn SourceCoordinator>>,
    pub(crate) receive_buffers: Arc<ReceiveBufferRegistry>,
    pub(crate) peers: Option<PeerContext>,
}

#[derive(Clone)]
pub(crate) struct PeerContext {
    pub(crate) membership: Arc<PeerMembership>,
    pub(crate) client: Arc<dyn PeerClient>,
    pub(crate) discovery: Option<(Arc<dyn PeerDiscovery>, Duration)>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            circuit_breaker: Arc::new(NeverOpen),
            dead_letters: None,
            ack_manager: None,
            coordinator: None,
            receive_buffers: Arc::new(ReceiveBufferRegistry::new()),
            peers: None,
        }
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate buffer admission and peer sends on `breaker`.
    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Share an acknowledgement manager instead of creating one per pipeline.
    pub fn with_ack_manager(mut self, manager: Arc<AcknowledgementSetManager>) -> Self {
        self.ack_manager = Some(manager);
        self
    }

    /// Partition coordinator offered to the source. Its leases are given up
    /// on shutdown.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn SourceCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Registry the node's server writes forwarded batches into.
    pub fn with_receive_buffers(mut self, registry: Arc<ReceiveBufferRegistry>) -> Self {
        self.receive_buffers = registry;
        self
    }

    /// Cluster membership and transport for forwarding processors.
    pub fn with_peers(mut self, membership: Arc<PeerMembership>, client: Arc<dyn PeerClient>) -> Self {
        self.peers = Some(PeerContext {
            membership,
            client,
            discovery: None,
        });
        self
    }

    /// Keep membership current by polling `discovery` while the pipeline
    /// runs. Has no effect without [`with_peers`](Self::with_peers).
    pub fn with_peer_discovery(mut self, discovery: Arc<dyn PeerDiscovery>, interval: Duration) -> Self {
        if let Some(peers) = self.peers.as_mut() {
            peers.discovery = Some((discovery, interval));
        }
        self
    }

    pub fn receive_buffers(&self) -> &Arc<ReceiveBufferRegistry> {
        &self.receive_buffers
    }

    pub fn membership(&self) -> Option<&Arc<PeerMembership>> {
        self.peers.as_ref().map(|p| &p.membership)
    }
}
