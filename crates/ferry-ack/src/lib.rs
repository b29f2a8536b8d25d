//! End-to-end acknowledgement tracking.
//!
//! An [`AcknowledgementSet`] counts the events added to it and fires its
//! callback once: `true` when every event was released positively after the
//! set was sealed with [`AcknowledgementSet::complete`], `false` as soon as
//! any event is released negatively or the set outlives its timeout.
//!
//! The [`AcknowledgementSetManager`] creates sets and runs the background
//! sweep that expires them.

pub mod error;
pub mod manager;
pub mod set;

pub use error::{AckError, AckResult};
pub use manager::{AckManagerConfig, AcknowledgementSetManager};
pub use set::{AckCallback, AckSetId, AckSetStatus, AcknowledgementSet};
