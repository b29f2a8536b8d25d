//! Partition leasing for distributed sources.
//!
//! Sources that split external work into partitions (shards, object
//! prefixes, collections) use a [`SourceCoordinator`] so that each partition
//! is processed by one node at a time and its progress survives a crash.
//!
//! # Protocol
//!
//! ```text
//! UNASSIGNED -> ASSIGNED(owner, lease) -> renewed | CLOSED | COMPLETED
//!                      |
//!                      +-- lease expires --> claimable again
//! ```
//!
//! All ownership changes go through [`SourceCoordinationStore::try_update_item`],
//! a compare-and-swap on the item's version, so any number of nodes may
//! race on the same store.

pub mod coordinator;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use coordinator::{
    CoordinatorConfig, LeaseBasedSourceCoordinator, PartitionSeed, PartitionSupplier,
    PartitionSupply, SourceCoordinator,
};
pub use error::{CoordError, CoordResult};
pub use memory::InMemoryCoordinationStore;
pub use store::SourceCoordinationStore;
pub use types::{Partition, PartitionItem, PartitionStatus};
