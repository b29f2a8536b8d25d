use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry_ack::{AcknowledgementSet, AcknowledgementSetManager};
use ferry_buffer::{AccumulatorConfig, Buffer, BufferAccumulator};
use ferry_coord::SourceCoordinator;
use ferry_types::{Event, Record};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineResult;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Produces events into the pipeline buffer.
///
/// `run` is spawned once per pipeline and should return when
/// [`SourceContext::cancelled`] fires or the input is exhausted.
#[async_trait]
pub trait Source: Send + Sync {
    async fn run(&self, ctx: SourceContext) -> PipelineResult<()>;
}

/// Transforms a batch of events. One instance per worker, so `&mut self`
/// state is never shared between workers.
#[async_trait]
pub trait Processor: Send {
    async fn execute(&mut self, events: Vec<Event>) -> PipelineResult<Vec<Event>>;

    /// Called once when the pipeline starts draining.
    fn prepare_for_shutdown(&mut self) {}

    /// The worker keeps feeding (possibly empty) batches until this holds.
    fn is_ready_for_shutdown(&self) -> bool {
        true
    }

    /// Processors keeping per-key state return their identification keys
    /// here so that events sharing them land on one node.
    fn peer_forwarding(&self) -> Option<&dyn RequiresPeerForwarding> {
        None
    }
}

/// Declares the event keys whose values decide the owning peer.
pub trait RequiresPeerForwarding: Send + Sync {
    fn identification_keys(&self) -> Vec<String>;
}

/// Emits processed events. Shared by every worker of a pipeline.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn output(&self, events: &[Event]) -> PipelineResult<()>;

    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// SourceContext
// ---------------------------------------------------------------------------

/// What a running source gets to work with.
#[derive(Clone)]
pub struct SourceContext {
    pipeline: String,
    buffer: Arc<dyn Buffer<Event>>,
    acknowledgements: Option<(Arc<AcknowledgementSetManager>, Duration)>,
    coordinator: Option<Arc<dyn SourceCoordinator>>,
    cancel: CancellationToken,
}

impl SourceContext {
    pub fn new(
        pipeline: impl Into<String>,
        buffer: Arc<dyn Buffer<Event>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            buffer,
            acknowledgements: None,
            coordinator: None,
            cancel,
        }
    }

    pub fn with_acknowledgements(
        mut self,
        manager: Arc<AcknowledgementSetManager>,
        timeout: Duration,
    ) -> Self {
        self.acknowledgements = Some((manager, timeout));
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn SourceCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn buffer(&self) -> &Arc<dyn Buffer<Event>> {
        &self.buffer
    }

    pub fn coordinator(&self) -> Option<&Arc<dyn SourceCoordinator>> {
        self.coordinator.as_ref()
    }

    pub fn acknowledgements_enabled(&self) -> bool {
        self.acknowledgements.is_some()
    }

    /// Open an acknowledgement set for a cohort of events, or `None` when
    /// the pipeline runs without end-to-end acknowledgements.
    pub fn create_ack_set<F>(&self, callback: F) -> Option<AcknowledgementSet>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.acknowledgements
            .as_ref()
            .map(|(manager, timeout)| manager.create(callback, *timeout))
    }

    /// Batches single writes into the pipeline buffer.
    pub fn accumulator(&self, config: AccumulatorConfig) -> BufferAccumulator<Event> {
        BufferAccumulator::new(self.buffer.clone(), config)
    }

    pub async fn write(&self, event: Event, timeout: Duration) -> PipelineResult<()> {
        self.buffer.write(Record::new(event), timeout).await?;
        Ok(())
    }

    pub async fn write_all(&self, events: Vec<Event>, timeout: Duration) -> PipelineResult<()> {
        let records = events.into_iter().map(Record::new).collect();
        self.buffer.write_all(records, timeout).await?;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
