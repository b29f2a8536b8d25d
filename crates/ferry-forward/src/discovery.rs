use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ForwardError, ForwardResult};
use crate::ring::HashRing;

/// Source of the current peer list.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn peers(&self) -> ForwardResult<Vec<String>>;
}

/// A fixed peer list from configuration.
#[derive(Clone, Debug)]
pub struct StaticPeerDiscovery {
    peers: Vec<String>,
}

impl StaticPeerDiscovery {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeerDiscovery {
    async fn peers(&self) -> ForwardResult<Vec<String>> {
        Ok(self.peers.clone())
    }
}

/// Peers are every address a DNS name resolves to, on a fixed port.
#[derive(Clone, Debug)]
pub struct DnsPeerDiscovery {
    domain: String,
    port: u16,
}

impl DnsPeerDiscovery {
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
        }
    }
}

#[async_trait]
impl PeerDiscovery for DnsPeerDiscovery {
    async fn peers(&self) -> ForwardResult<Vec<String>> {
        let addrs = tokio::net::lookup_host((self.domain.as_str(), self.port))
            .await
            .map_err(|e| ForwardError::Discovery(format!("resolving {}: {e}", self.domain)))?;
        let peers: BTreeSet<String> = addrs.map(|addr| addr.to_string()).collect();
        debug!(domain = %self.domain, count = peers.len(), "dns discovery");
        Ok(peers.into_iter().collect())
    }
}

/// The live hash ring plus this node's own address.
///
/// Readers get an `Arc` snapshot of the ring, so a rebuild never blocks
/// routing for longer than a pointer swap.
pub struct PeerMembership {
    ring: RwLock<Arc<HashRing>>,
    local_address: String,
}

impl PeerMembership {
    pub fn new(ring: HashRing, local_address: impl Into<String>) -> Self {
        Self {
            ring: RwLock::new(Arc::new(ring)),
            local_address: local_address.into(),
        }
    }

    /// Build the initial ring from `discovery`.
    pub async fn discover(
        discovery: &dyn PeerDiscovery,
        virtual_nodes: usize,
        local_address: impl Into<String>,
    ) -> ForwardResult<Self> {
        let ring = HashRing::new(discovery.peers().await?, virtual_nodes)?;
        Ok(Self::new(ring, local_address))
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().expect("membership lock poisoned").clone()
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn is_local(&self, peer: &str) -> bool {
        peer == self.local_address
    }

    /// Rebuild the ring if the peer set changed. Returns `true` on rebuild.
    ///
    /// An empty discovery result keeps the current ring.
    pub async fn refresh(&self, discovery: &dyn PeerDiscovery) -> ForwardResult<bool> {
        let peers: BTreeSet<String> = discovery.peers().await?.into_iter().collect();
        if peers.is_empty() {
            warn!("peer discovery returned no peers; keeping current ring");
            return Ok(false);
        }

        let current = self.ring();
        if current.peers() == &peers {
            return Ok(false);
        }
        let rebuilt = HashRing::new(peers, current.virtual_nodes())?;
        info!(
            before = current.peers().len(),
            after = rebuilt.peers().len(),
            "peer membership changed; hash ring rebuilt"
        );
        *self.ring.write().expect("membership lock poisoned") = Arc::new(rebuilt);
        Ok(true)
    }

    /// Poll `discovery` every `interval` until `cancel` fires.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        discovery: Arc<dyn PeerDiscovery>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let membership = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = membership.refresh(discovery.as_ref()).await {
                            warn!(error = %e, "peer discovery refresh failed");
                        }
                    }
                }
            }
            debug!("peer membership watcher stopped");
        })
    }
}
