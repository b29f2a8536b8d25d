use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::store::SourceCoordinationStore;
use crate::types::{Partition, PartitionItem, PartitionStatus};

const GLOBAL_LEASE_KEY: &str = "global-lease";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lease granted when a partition is acquired.
    pub lease_duration: Duration,
    /// Lease on the per-source leader item that gates partition discovery.
    pub global_lease_duration: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(10 * 60),
            global_lease_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// A unit of work found by a [`PartitionSupplier`].
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionSeed {
    pub key: String,
    pub initial_state: Option<Value>,
}

impl PartitionSeed {
    pub fn new(key: impl Into<String>, initial_state: Option<Value>) -> Self {
        Self {
            key: key.into(),
            initial_state,
        }
    }
}

/// What a supplier found, plus the state it wants back next time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionSupply {
    pub partitions: Vec<PartitionSeed>,
    pub global_state: Option<Value>,
}

/// Discovers new partitions. Runs only on the node holding the source's
/// global lease.
#[async_trait]
pub trait PartitionSupplier: Send + Sync {
    /// `global_state` is what the previous run returned.
    async fn supply(&self, global_state: Option<&Value>) -> CoordResult<PartitionSupply>;
}

/// Partition leasing as seen by a distributed source.
#[async_trait]
pub trait SourceCoordinator: Send + Sync {
    /// Claim one claimable partition for this node, or `None`.
    async fn get_next_partition(&self) -> CoordResult<Option<Partition>>;

    /// Like [`get_next_partition`](Self::get_next_partition), but when nothing
    /// is claimable and this node wins the global lease, runs `supplier` to
    /// create new partitions and tries once more.
    async fn get_next_partition_with(
        &self,
        supplier: &dyn PartitionSupplier,
    ) -> CoordResult<Option<Partition>>;

    /// Seed a new partition. Returns `false` if it already exists.
    async fn create_partition(&self, key: &str, initial_state: Option<Value>) -> CoordResult<bool>;

    /// Persist progress and renew the lease by `extend_by`.
    async fn save_state_for_partition(
        &self,
        key: &str,
        state: Value,
        extend_by: Duration,
    ) -> CoordResult<()>;

    /// Mark the partition done for good.
    async fn complete_partition(&self, key: &str) -> CoordResult<()>;

    /// Close the partition. It is never offered again.
    async fn close_partition(&self, key: &str) -> CoordResult<()>;

    /// Close the partition until `reopen_after` has passed. Once it has been
    /// closed `max_closed_count` times it is completed instead.
    async fn close_partition_for_reopen(
        &self,
        key: &str,
        reopen_after: Duration,
        max_closed_count: u32,
    ) -> CoordResult<()>;

    /// Hand back every lease this node holds.
    async fn give_up_partitions(&self) -> CoordResult<()>;
}

/// [`SourceCoordinator`] over any [`SourceCoordinationStore`].
pub struct LeaseBasedSourceCoordinator {
    source_identifier: String,
    owner_id: String,
    store: Arc<dyn SourceCoordinationStore>,
    config: CoordinatorConfig,
    /// Leases this node believes it holds, by partition key.
    owned: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LeaseBasedSourceCoordinator {
    pub fn new(
        source_identifier: impl Into<String>,
        owner_id: impl Into<String>,
        store: Arc<dyn SourceCoordinationStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            source_identifier: source_identifier.into(),
            owner_id: owner_id.into(),
            store,
            config,
            owned: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh, unique owner id for this process.
    pub fn generate_owner_id() -> String {
        format!("node-{}", uuid::Uuid::now_v7().simple())
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn source_identifier(&self) -> &str {
        &self.source_identifier
    }

    /// Keys of the partitions this node currently holds a live lease on.
    pub fn owned_partitions(&self) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .owned()
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.owned.lock().expect("owned partitions lock poisoned")
    }

    fn global_source(&self) -> String {
        format!("{}|{}", self.source_identifier, GLOBAL_LEASE_KEY)
    }

    /// Load `key` and check this node holds its lease.
    async fn owned_item(&self, key: &str, now: DateTime<Utc>) -> CoordResult<PartitionItem> {
        let item = self
            .store
            .get_item(&self.source_identifier, key)
            .await?
            .ok_or_else(|| CoordError::PartitionNotFound { key: key.to_string() })?;
        if !item.is_owned_by(&self.owner_id, now) {
            self.lose(key);
            return Err(CoordError::PartitionNotOwned { key: key.to_string() });
        }
        Ok(item)
    }

    /// Write an update to an owned partition. A lost race means ownership
    /// was lost.
    async fn update_owned(&self, item: PartitionItem) -> CoordResult<PartitionItem> {
        let key = item.partition_key.clone();
        match self.store.try_update_item(item).await {
            Ok(stored) => Ok(stored),
            Err(CoordError::ConditionalUpdateFailed { .. }) => {
                self.lose(&key);
                Err(CoordError::PartitionNotOwned { key })
            }
            Err(e) => Err(e),
        }
    }

    fn lose(&self, key: &str) {
        if self.owned().remove(key).is_some() {
            warn!(
                source = %self.source_identifier,
                partition = %key,
                owner = %self.owner_id,
                "partition ownership lost"
            );
        }
    }

    fn release(&self, key: &str) {
        self.owned().remove(key);
    }

    /// Claim or renew the per-source leader lease.
    async fn try_acquire_global_lease(&self) -> CoordResult<Option<PartitionItem>> {
        let source = self.global_source();
        let now = Utc::now();
        let expires = lease_until(now, self.config.global_lease_duration)?;

        let Some(mut item) = self.store.get_item(&source, GLOBAL_LEASE_KEY).await? else {
            let mut fresh = PartitionItem::new(&source, GLOBAL_LEASE_KEY, None);
            fresh.status = PartitionStatus::Assigned;
            fresh.owner = Some(self.owner_id.clone());
            fresh.ownership_expires_at = Some(expires);
            if self.store.try_create_item(fresh.clone()).await? {
                info!(source = %self.source_identifier, owner = %self.owner_id, "acquired global lease");
                return Ok(Some(fresh));
            }
            return Ok(None);
        };

        if !item.is_owned_by(&self.owner_id, now) && !item.is_claimable(now) {
            return Ok(None);
        }
        item.status = PartitionStatus::Assigned;
        item.owner = Some(self.owner_id.clone());
        item.ownership_expires_at = Some(expires);
        match self.store.try_update_item(item).await {
            Ok(stored) => {
                debug!(source = %self.source_identifier, owner = %self.owner_id, "holding global lease");
                Ok(Some(stored))
            }
            Err(CoordError::ConditionalUpdateFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_supplier(
        &self,
        mut global: PartitionItem,
        supplier: &dyn PartitionSupplier,
    ) -> CoordResult<()> {
        let supply = supplier.supply(global.progress_state.as_ref()).await?;
        let mut created = 0;
        for seed in supply.partitions {
            if self.create_partition(&seed.key, seed.initial_state).await? {
                created += 1;
            }
        }
        info!(source = %self.source_identifier, created, "partition supplier ran");

        global.progress_state = supply.global_state;
        match self.store.try_update_item(global).await {
            Ok(_) => Ok(()),
            Err(CoordError::ConditionalUpdateFailed { .. }) => {
                warn!(source = %self.source_identifier, "global lease lost while saving supplier state");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn lease_until(now: DateTime<Utc>, duration: Duration) -> CoordResult<DateTime<Utc>> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| CoordError::Config(format!("lease duration {duration:?} out of range")))
}

/// Unassigned first, then reopened closed partitions, then expired leases.
fn acquisition_rank(status: PartitionStatus) -> u8 {
    match status {
        PartitionStatus::Unassigned => 0,
        PartitionStatus::Closed => 1,
        PartitionStatus::Assigned => 2,
        PartitionStatus::Completed => 3,
    }
}

#[async_trait]
impl SourceCoordinator for LeaseBasedSourceCoordinator {
    async fn get_next_partition(&self) -> CoordResult<Option<Partition>> {
        let now = Utc::now();
        let held = self.owned_partitions();

        let mut candidates: Vec<PartitionItem> = self
            .store
            .list_items(&self.source_identifier)
            .await?
            .into_iter()
            .filter(|item| item.is_claimable(now) && !held.contains(&item.partition_key))
            .collect();
        candidates.sort_by(|a, b| {
            acquisition_rank(a.status)
                .cmp(&acquisition_rank(b.status))
                .then_with(|| a.partition_key.cmp(&b.partition_key))
        });

        let expires = lease_until(now, self.config.lease_duration)?;
        for mut item in candidates {
            let key = item.partition_key.clone();
            let previous = item.status;
            item.status = PartitionStatus::Assigned;
            item.owner = Some(self.owner_id.clone());
            item.ownership_expires_at = Some(expires);
            item.reopen_at = None;

            match self.store.try_update_item(item).await {
                Ok(stored) => {
                    self.owned().insert(key.clone(), expires);
                    info!(
                        source = %self.source_identifier,
                        partition = %key,
                        owner = %self.owner_id,
                        from = ?previous,
                        "partition acquired"
                    );
                    return Ok(Some(Partition::new(key, stored.progress_state, expires)));
                }
                Err(CoordError::ConditionalUpdateFailed { .. } | CoordError::PartitionNotFound { .. }) => {
                    debug!(partition = %key, "lost acquisition race");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn get_next_partition_with(
        &self,
        supplier: &dyn PartitionSupplier,
    ) -> CoordResult<Option<Partition>> {
        if let Some(partition) = self.get_next_partition().await? {
            return Ok(Some(partition));
        }
        match self.try_acquire_global_lease().await? {
            Some(global) => {
                self.run_supplier(global, supplier).await?;
                self.get_next_partition().await
            }
            None => Ok(None),
        }
    }

    async fn create_partition(&self, key: &str, initial_state: Option<Value>) -> CoordResult<bool> {
        let created = self
            .store
            .try_create_item(PartitionItem::new(&self.source_identifier, key, initial_state))
            .await?;
        if created {
            debug!(source = %self.source_identifier, partition = %key, "partition created");
        }
        Ok(created)
    }

    async fn save_state_for_partition(
        &self,
        key: &str,
        state: Value,
        extend_by: Duration,
    ) -> CoordResult<()> {
        let now = Utc::now();
        let mut item = self.owned_item(key, now).await?;
        let expires = lease_until(now, extend_by)?;
        item.progress_state = Some(state);
        item.ownership_expires_at = Some(expires);

        self.update_owned(item).await?;
        self.owned().insert(key.to_string(), expires);
        debug!(partition = %key, "partition state saved");
        Ok(())
    }

    async fn complete_partition(&self, key: &str) -> CoordResult<()> {
        let mut item = self.owned_item(key, Utc::now()).await?;
        item.status = PartitionStatus::Completed;
        item.clear_ownership();

        self.update_owned(item).await?;
        self.release(key);
        info!(source = %self.source_identifier, partition = %key, "partition completed");
        Ok(())
    }

    async fn close_partition(&self, key: &str) -> CoordResult<()> {
        let mut item = self.owned_item(key, Utc::now()).await?;
        item.status = PartitionStatus::Closed;
        item.closed_count += 1;
        item.reopen_at = None;
        item.clear_ownership();

        self.update_owned(item).await?;
        self.release(key);
        info!(source = %self.source_identifier, partition = %key, "partition closed");
        Ok(())
    }

    async fn close_partition_for_reopen(
        &self,
        key: &str,
        reopen_after: Duration,
        max_closed_count: u32,
    ) -> CoordResult<()> {
        let now = Utc::now();
        let mut item = self.owned_item(key, now).await?;
        item.closed_count += 1;
        item.clear_ownership();
        if item.closed_count >= max_closed_count {
            item.status = PartitionStatus::Completed;
            item.reopen_at = None;
        } else {
            item.status = PartitionStatus::Closed;
            item.reopen_at = Some(lease_until(now, reopen_after)?);
        }
        let status = item.status;
        let closed_count = item.closed_count;

        self.update_owned(item).await?;
        self.release(key);
        info!(
            source = %self.source_identifier,
            partition = %key,
            closed_count,
            status = ?status,
            "partition closed for reopen"
        );
        Ok(())
    }

    async fn give_up_partitions(&self) -> CoordResult<()> {
        let keys: Vec<String> = self.owned().drain().map(|(k, _)| k).collect();
        let now = Utc::now();
        for key in keys {
            let Some(mut item) = self.store.get_item(&self.source_identifier, &key).await? else {
                continue;
            };
            if !item.is_owned_by(&self.owner_id, now) {
                continue;
            }
            item.status = PartitionStatus::Unassigned;
            item.clear_ownership();
            match self.store.try_update_item(item).await {
                Ok(_) => info!(source = %self.source_identifier, partition = %key, "partition given up"),
                Err(CoordError::ConditionalUpdateFailed { .. }) => {
                    warn!(partition = %key, "partition changed hands while giving it up")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCoordinationStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(lease: Duration) -> CoordinatorConfig {
        CoordinatorConfig {
            lease_duration: lease,
            global_lease_duration: Duration::from_secs(60),
        }
    }

    fn node(store: &Arc<InMemoryCoordinationStore>, owner: &str, lease: Duration) -> LeaseBasedSourceCoordinator {
        LeaseBasedSourceCoordinator::new("s3-source", owner, store.clone(), config(lease))
    }

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn create_partition_is_idempotent() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        assert!(a.create_partition("p1", Some(json!({"offset": 0}))).await.unwrap());
        assert!(!a.create_partition("p1", None).await.unwrap());
    }

    #[tokio::test]
    async fn claimed_partition_is_not_offered_to_others() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        let b = node(&store, "b", LONG);
        a.create_partition("p1", Some(json!({"offset": 7}))).await.unwrap();

        let claimed = a.get_next_partition().await.unwrap().unwrap();
        assert_eq!(claimed.key(), "p1");
        assert_eq!(claimed.progress_state(), Some(&json!({"offset": 7})));
        assert!(b.get_next_partition().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn node_is_not_handed_a_lease_it_holds() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        a.create_partition("p1", None).await.unwrap();
        a.create_partition("p2", None).await.unwrap();

        assert_eq!(a.get_next_partition().await.unwrap().unwrap().key(), "p1");
        assert_eq!(a.get_next_partition().await.unwrap().unwrap().key(), "p2");
        assert!(a.get_next_partition().await.unwrap().is_none());
        assert_eq!(a.owned_partitions(), vec!["p1", "p2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_nodes_claim_exactly_once() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        node(&store, "seed", LONG).create_partition("only", None).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = node(&store, &format!("n{i}"), LONG);
                tokio::spawn(async move { coordinator.get_next_partition().await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_lease_moves_and_old_owner_cannot_save() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", Duration::from_millis(50));
        let b = node(&store, "b", LONG);
        a.create_partition("p1", None).await.unwrap();
        a.get_next_partition().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let err = a
            .save_state_for_partition("p1", json!({"offset": 1}), LONG)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::PartitionNotOwned { key: "p1".into() });

        let taken = b.get_next_partition().await.unwrap().unwrap();
        assert_eq!(taken.key(), "p1");
        assert!(a.owned_partitions().is_empty());
        assert!(matches!(
            a.save_state_for_partition("p1", json!({}), LONG).await,
            Err(CoordError::PartitionNotOwned { .. })
        ));
        b.save_state_for_partition("p1", json!({"offset": 2}), LONG)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_state_persists_and_extends() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", Duration::from_millis(50));
        a.create_partition("p1", None).await.unwrap();
        a.get_next_partition().await.unwrap().unwrap();

        a.save_state_for_partition("p1", json!({"offset": 42}), LONG)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let item = store.get_item("s3-source", "p1").await.unwrap().unwrap();
        assert_eq!(item.progress_state, Some(json!({"offset": 42})));
        assert!(item.is_owned_by("a", Utc::now()));
    }

    #[tokio::test]
    async fn completed_and_closed_partitions_are_not_reoffered() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        let b = node(&store, "b", LONG);
        a.create_partition("done", None).await.unwrap();
        a.create_partition("shut", None).await.unwrap();

        a.get_next_partition().await.unwrap().unwrap();
        a.get_next_partition().await.unwrap().unwrap();
        a.complete_partition("done").await.unwrap();
        a.close_partition("shut").await.unwrap();

        assert!(b.get_next_partition().await.unwrap().is_none());
        assert!(a.owned_partitions().is_empty());
        assert_eq!(
            store.get_item("s3-source", "shut").await.unwrap().unwrap().status,
            PartitionStatus::Closed
        );
    }

    #[tokio::test]
    async fn closed_partition_reopens_then_completes_at_limit() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        a.create_partition("p1", None).await.unwrap();

        a.get_next_partition().await.unwrap().unwrap();
        a.close_partition_for_reopen("p1", Duration::from_millis(30), 2)
            .await
            .unwrap();
        assert!(a.get_next_partition().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.get_next_partition().await.unwrap().unwrap().key(), "p1");

        a.close_partition_for_reopen("p1", Duration::from_millis(1), 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.get_next_partition().await.unwrap().is_none());
        let item = store.get_item("s3-source", "p1").await.unwrap().unwrap();
        assert_eq!(item.status, PartitionStatus::Completed);
        assert_eq!(item.closed_count, 2);
    }

    #[tokio::test]
    async fn unassigned_preferred_over_expired() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", Duration::from_millis(20));
        let b = node(&store, "b", LONG);
        a.create_partition("a-old", None).await.unwrap();
        a.get_next_partition().await.unwrap().unwrap();
        a.create_partition("z-new", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(b.get_next_partition().await.unwrap().unwrap().key(), "z-new");
        assert_eq!(b.get_next_partition().await.unwrap().unwrap().key(), "a-old");
    }

    #[tokio::test]
    async fn give_up_releases_for_other_nodes() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        let b = node(&store, "b", LONG);
        a.create_partition("p1", None).await.unwrap();
        a.get_next_partition().await.unwrap().unwrap();

        a.give_up_partitions().await.unwrap();
        assert!(a.owned_partitions().is_empty());
        assert_eq!(b.get_next_partition().await.unwrap().unwrap().key(), "p1");
    }

    struct CountingSupplier {
        calls: AtomicUsize,
        keys: Vec<&'static str>,
    }

    #[async_trait]
    impl PartitionSupplier for CountingSupplier {
        async fn supply(&self, global_state: Option<&Value>) -> CoordResult<PartitionSupply> {
            let run = self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(global_state.is_some(), run > 0);
            Ok(PartitionSupply {
                partitions: self.keys.iter().map(|k| PartitionSeed::new(*k, None)).collect(),
                global_state: Some(json!({"runs": run + 1})),
            })
        }
    }

    #[tokio::test]
    async fn only_the_global_lease_holder_supplies_partitions() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = node(&store, "a", LONG);
        let b = node(&store, "b", LONG);
        let c = node(&store, "c", LONG);
        let supplier = CountingSupplier {
            calls: AtomicUsize::new(0),
            keys: vec!["p1", "p2"],
        };

        assert_eq!(a.get_next_partition_with(&supplier).await.unwrap().unwrap().key(), "p1");
        assert_eq!(supplier.calls.load(Ordering::SeqCst), 1);

        assert_eq!(b.get_next_partition_with(&supplier).await.unwrap().unwrap().key(), "p2");
        assert_eq!(supplier.calls.load(Ordering::SeqCst), 1);

        // Nothing claimable and the global lease belongs to `a`.
        assert!(c.get_next_partition_with(&supplier).await.unwrap().is_none());
        assert_eq!(supplier.calls.load(Ordering::SeqCst), 1);

        // The leader runs the supplier again and sees its saved state.
        assert!(a.get_next_partition_with(&supplier).await.unwrap().is_none());
        assert_eq!(supplier.calls.load(Ordering::SeqCst), 2);
        let global = store
            .get_item("s3-source|global-lease", GLOBAL_LEASE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(global.progress_state, Some(json!({"runs": 2})));
    }
}
