//! Peer forwarding for processors that need every event with the same
//! identification keys on one node.
//!
//! # Architecture
//!
//! ```text
//!  worker batch ──> PeerForwarder::forward
//!                     │  hash(identification values) -> HashRing owner
//!                     ├── owner == self ─────────────> returned for local processing
//!                     └── owner == peer ─> per-peer sender task ─> PeerClient (HTTP)
//!                                             │ retries exhausted / circuit open
//!                                             └─> ForwardingFailurePolicy
//!                                                   ├─ ProcessLocally -> receive buffer
//!                                                   └─ DeadLetter     -> DeadLetterSink
//! ```
//!
//! Batches arriving from peers land in the processor's receive buffer (see
//! [`ReceiveBufferRegistry`]) and are returned by the next `forward` call.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod forwarder;
pub mod registry;
pub mod ring;
pub mod wire;

pub use client::{HttpPeerClient, PeerClient, FORWARD_PATH};
pub use config::{ForwarderConfig, ForwardingFailurePolicy};
pub use discovery::{DnsPeerDiscovery, PeerDiscovery, PeerMembership, StaticPeerDiscovery};
pub use error::{ForwardError, ForwardResult};
pub use forwarder::PeerForwarder;
pub use registry::ReceiveBufferRegistry;
pub use ring::{hash_identification_values, HashRing, DEFAULT_VIRTUAL_NODES};
pub use wire::{WireBatch, WireEvent};
