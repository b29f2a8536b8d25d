//! Record buffers for the ferry pipeline.
//!
//! A buffer decouples sources from the processing loop. Sources write
//! records; workers read batches and retire them with an explicit
//! checkpoint once every sink has accepted them.
//!
//! # Delivery
//!
//! [`BlockingBuffer`] is at-least-once by default: a batch that is not
//! checkpointed within the visibility timeout is handed to a later `read`
//! again. Configuring no visibility timeout selects best-effort delivery,
//! where checked-out batches are never redelivered.
//!
//! # Variants
//!
//! - [`BlockingBuffer`] -- bounded in-memory queue
//! - [`DurableBuffer`] -- in-memory queue backed by a [`WriteAheadLog`] so
//!   unretired records survive a restart
//! - [`CircuitBreakingBuffer`] -- rejects writes while a circuit breaker is open
//!
//! [`BufferAccumulator`] batches single-record writes into `write_all` calls.

pub mod accumulator;
pub mod blocking;
pub mod checkpoint;
pub mod circuit;
pub mod durable;
pub mod error;
pub mod traits;
pub mod wal;

pub use accumulator::{AccumulatorConfig, BufferAccumulator};
pub use blocking::{BlockingBuffer, BufferConfig};
pub use checkpoint::{CheckpointId, CheckpointState};
pub use circuit::CircuitBreakingBuffer;
pub use durable::DurableBuffer;
pub use error::{BufferError, BufferResult};
pub use traits::{Buffer, DeliveryMode};
pub use wal::{SyncMode, WalConfig, WriteAheadLog};
