use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ring::DEFAULT_VIRTUAL_NODES;

/// What happens to events that cannot reach their owning peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingFailurePolicy {
    /// Process on this node instead. Key affinity is lost for those events.
    #[default]
    ProcessLocally,
    /// Hand the events to the dead-letter sink.
    DeadLetter,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// This node's address as it appears in the peer list.
    pub local_address: String,
    pub virtual_nodes: usize,
    /// Maximum events per request to a peer.
    pub batch_size: usize,
    /// How long a sender waits to fill a batch.
    pub batch_timeout: Duration,
    pub request_timeout: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// First retry delay; doubles on each retry.
    pub retry_backoff: Duration,
    /// Events queued per peer before the failure policy applies.
    pub sender_queue_capacity: usize,
    /// Timeout for writing fallback events into the receive buffer.
    pub local_write_timeout: Duration,
    pub failure_policy: ForwardingFailurePolicy,
    /// How long shutdown waits for queued forwards before abandoning them.
    pub drain_timeout: Duration,
    pub auth_token: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            local_address: "127.0.0.1:4994".into(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            batch_size: 48,
            batch_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            sender_queue_capacity: 512,
            local_write_timeout: Duration::from_secs(1),
            failure_policy: ForwardingFailurePolicy::default(),
            drain_timeout: Duration::from_secs(10),
            auth_token: None,
        }
    }
}
