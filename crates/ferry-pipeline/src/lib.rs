//! Pipeline assembly and execution for ferry.
//!
//! A pipeline is one source, a buffer, an ordered processor chain, and one
//! or more sinks. Plugins are looked up by name in a [`PluginRegistry`] and
//! validated before anything starts.
//!
//! # Architecture
//!
//! ```text
//!  Source ──write──> Buffer ──read──> ProcessWorker (x workers)
//!                      ^                 │ per processor:
//!                      │                 │   PeerForwarder (if keyed) -> Processor
//!                      │                 ├──> every Sink
//!                      └──checkpoint─────┘  (only after all sinks succeed)
//! ```
//!
//! With acknowledgements enabled, sources group events into acknowledgement
//! sets; workers release each event's handle when it is dropped by a
//! processor, delivered by every sink, or fails.

pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod worker;

pub use config::{PipelineConfig, PluginSetting};
pub use context::PipelineContext;
pub use error::{PipelineError, PipelineResult, PluginKind};
pub use pipeline::{Pipeline, PipelineReport};
pub use plugin::{Processor, RequiresPeerForwarding, Sink, Source, SourceContext};
pub use registry::{PluginRegistry, ProcessorFactory, SinkFactory, SourceFactory};
pub use worker::{ProcessWorker, WorkerReport};
