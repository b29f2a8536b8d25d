//! Foundation types for the ferry event pipeline.
//!
//! Every other ferry crate depends on `ferry-types`. It defines the payload
//! that flows from sources to sinks and the small contracts shared by the
//! buffering, acknowledgement, and forwarding layers.
//!
//! # Key Types
//!
//! - [`Event`]: structured payload with immutable-by-default [`EventMetadata`]
//! - [`Record`]: transport wrapper holding one payload inside a buffer
//! - [`EventHandle`]: per-event acknowledgement hook released by sinks
//! - [`CircuitBreaker`]: boolean admission gate consulted before writes
//! - [`DeadLetterSink`]: fallback destination for undeliverable events

pub mod circuit;
pub mod dlq;
pub mod error;
pub mod event;
pub mod handle;
pub mod record;

pub use circuit::{CircuitBreaker, ManualCircuitBreaker, NeverOpen, ThresholdCircuitBreaker};
pub use dlq::{DeadLetterRecord, DeadLetterSink, InMemoryDeadLetterSink};
pub use error::TypeError;
pub use event::{Event, EventId, EventMetadata, EventMetadataBuilder};
pub use handle::{EventHandle, ReleaseTarget};
pub use record::Record;
