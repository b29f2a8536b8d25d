use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ferry_buffer::{Buffer, CheckpointState};
use ferry_forward::PeerForwarder;
use ferry_types::{Event, EventHandle, EventId, Record};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineResult;
use crate::plugin::{Processor, Sink};

/// Pause after a failed read so a broken buffer does not spin the worker.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters one worker reports when it stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub batches: u64,
    pub events_read: u64,
    pub events_emitted: u64,
    pub failed_batches: u64,
}

struct Stage {
    processor: Box<dyn Processor>,
    forwarder: Option<Arc<PeerForwarder>>,
}

/// One processing loop: read a batch, route it, run the processor chain,
/// write to every sink, then checkpoint.
///
/// A batch whose processing or sink output fails is not checkpointed, so an
/// at-least-once buffer hands it out again after the visibility timeout.
pub struct ProcessWorker {
    report: WorkerReport,
    pipeline: String,
    buffer: Arc<dyn Buffer<Event>>,
    stages: Vec<Stage>,
    sinks: Vec<Arc<dyn Sink>>,
    read_timeout: Duration,
    acknowledgements: bool,
    draining: CancellationToken,
    stop: CancellationToken,
}

impl ProcessWorker {
    pub fn new(
        id: usize,
        pipeline: impl Into<String>,
        buffer: Arc<dyn Buffer<Event>>,
        sinks: Vec<Arc<dyn Sink>>,
    ) -> Self {
        Self {
            report: WorkerReport {
                worker: id,
                ..WorkerReport::default()
            },
            pipeline: pipeline.into(),
            buffer,
            stages: Vec::new(),
            sinks,
            read_timeout: Duration::from_millis(500),
            acknowledgements: false,
            draining: CancellationToken::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Append a processor. With a forwarder, events are routed to their
    /// owning peer before the processor sees them.
    pub fn with_stage(
        mut self,
        processor: Box<dyn Processor>,
        forwarder: Option<Arc<PeerForwarder>>,
    ) -> Self {
        self.stages.push(Stage {
            processor,
            forwarder,
        });
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Release event handles as events leave the pipeline.
    pub fn with_acknowledgements(mut self, enabled: bool) -> Self {
        self.acknowledgements = enabled;
        self
    }

    /// `draining`: finish what is buffered, then exit. `stop`: exit now.
    pub fn with_signals(mut self, draining: CancellationToken, stop: CancellationToken) -> Self {
        self.draining = draining;
        self.stop = stop;
        self
    }

    pub async fn run(mut self) -> WorkerReport {
        let worker = self.report.worker;
        debug!(pipeline = %self.pipeline, worker, "worker started");
        let mut shutdown_prepared = false;
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            if self.draining.is_cancelled() {
                if !shutdown_prepared {
                    for stage in &mut self.stages {
                        stage.processor.prepare_for_shutdown();
                    }
                    shutdown_prepared = true;
                }
                if self.buffer.is_empty() && self.ready_for_shutdown() {
                    break;
                }
            }

            let read = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                read = self.buffer.read(self.read_timeout) => read,
            };
            match read {
                Ok((records, token)) => self.process(records, token).await,
                Err(e) => {
                    error!(pipeline = %self.pipeline, worker, error = %e, "buffer read failed");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
        info!(
            pipeline = %self.pipeline,
            worker,
            batches = self.report.batches,
            failed = self.report.failed_batches,
            "worker stopped"
        );
        self.report
    }

    fn ready_for_shutdown(&self) -> bool {
        self.stages.iter().all(|stage| {
            stage.processor.is_ready_for_shutdown()
                && stage.forwarder.as_ref().map_or(true, |f| f.is_idle())
        })
    }

    async fn process(&mut self, records: Vec<Record<Event>>, token: CheckpointState) {
        let has_forwarders = self.stages.iter().any(|s| s.forwarder.is_some());
        if records.is_empty() && !has_forwarders && !self.draining.is_cancelled() {
            return;
        }

        let events: Vec<Event> = records.into_iter().map(Record::into_data).collect();
        let read = events.len();
        let checkpoint = token.id();
        let outcome = match self.run_stages(events).await {
            Ok(output) => {
                let emitted = output.len();
                let written = emit(&self.sinks, &output).await;
                self.release(output.iter().map(Event::handle), written.is_ok());
                written.map(|()| emitted)
            }
            Err(e) => Err(e),
        };

        self.report.events_read += read as u64;
        match outcome {
            Ok(emitted) => {
                if let Err(e) = self.buffer.checkpoint(token) {
                    error!(pipeline = %self.pipeline, %checkpoint, error = %e, "checkpoint failed");
                }
                self.report.batches += 1;
                self.report.events_emitted += emitted as u64;
            }
            Err(e) => {
                self.report.failed_batches += 1;
                warn!(
                    pipeline = %self.pipeline,
                    worker = self.report.worker,
                    %checkpoint,
                    records = read,
                    error = %e,
                    "batch failed; left for redelivery"
                );
            }
        }
    }

    async fn run_stages(&mut self, mut events: Vec<Event>) -> PipelineResult<Vec<Event>> {
        let acknowledgements = self.acknowledgements;
        for stage in &mut self.stages {
            let inputs: Vec<(EventId, EventHandle)> = if acknowledgements {
                events.iter().map(|e| (e.id(), e.handle().clone())).collect()
            } else {
                Vec::new()
            };

            if let Some(forwarder) = &stage.forwarder {
                events = match forwarder.forward(events).await {
                    Ok(local) => local,
                    Err(e) => {
                        release_all(inputs.iter().map(|(_, h)| h), false);
                        return Err(e.into());
                    }
                };
            }
            let routed: Vec<(EventId, EventHandle)> = if acknowledgements {
                events.iter().map(|e| (e.id(), e.handle().clone())).collect()
            } else {
                Vec::new()
            };

            let output = match stage.processor.execute(events).await {
                Ok(output) => output,
                Err(e) => {
                    release_all(routed.iter().map(|(_, h)| h), false);
                    return Err(e);
                }
            };
            if acknowledgements {
                // Events the processor dropped are done.
                let kept: HashSet<EventId> = output.iter().map(Event::id).collect();
                release_all(
                    routed.iter().filter(|(id, _)| !kept.contains(id)).map(|(_, h)| h),
                    true,
                );
            }
            events = output;
        }
        Ok(events)
    }

    fn release<'a>(&self, handles: impl Iterator<Item = &'a EventHandle>, positive: bool) {
        if self.acknowledgements {
            release_all(handles, positive);
        }
    }
}

async fn emit(sinks: &[Arc<dyn Sink>], events: &[Event]) -> PipelineResult<()> {
    if events.is_empty() {
        return Ok(());
    }
    for sink in sinks {
        sink.output(events).await?;
    }
    Ok(())
}

fn release_all<'a>(handles: impl Iterator<Item = &'a EventHandle>, positive: bool) {
    for handle in handles {
        handle.release(positive);
    }
}
