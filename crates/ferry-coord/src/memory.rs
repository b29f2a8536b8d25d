use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{CoordError, CoordResult};
use crate::store::SourceCoordinationStore;
use crate::types::PartitionItem;

type ItemKey = (String, String);

/// Coordination store held in process memory.
///
/// Suitable for tests and single-node deployments; nodes sharing one
/// instance see the same compare-and-swap semantics a database backend
/// would give them.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    items: RwLock<BTreeMap<ItemKey, PartitionItem>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceCoordinationStore for InMemoryCoordinationStore {
    async fn get_item(
        &self,
        source_identifier: &str,
        partition_key: &str,
    ) -> CoordResult<Option<PartitionItem>> {
        let items = self.items.read().expect("coordination store lock poisoned");
        Ok(items
            .get(&(source_identifier.to_string(), partition_key.to_string()))
            .cloned())
    }

    async fn try_create_item(&self, item: PartitionItem) -> CoordResult<bool> {
        let mut items = self.items.write().expect("coordination store lock poisoned");
        let key = (item.source_identifier.clone(), item.partition_key.clone());
        if items.contains_key(&key) {
            return Ok(false);
        }
        items.insert(key, item);
        Ok(true)
    }

    async fn try_update_item(&self, mut item: PartitionItem) -> CoordResult<PartitionItem> {
        let mut items = self.items.write().expect("coordination store lock poisoned");
        let key = (item.source_identifier.clone(), item.partition_key.clone());
        let stored = items.get_mut(&key).ok_or_else(|| CoordError::PartitionNotFound {
            key: item.partition_key.clone(),
        })?;
        if stored.version != item.version {
            return Err(CoordError::ConditionalUpdateFailed {
                key: item.partition_key,
            });
        }
        item.version += 1;
        *stored = item.clone();
        Ok(item)
    }

    async fn list_items(&self, source_identifier: &str) -> CoordResult<Vec<PartitionItem>> {
        let items = self.items.read().expect("coordination store lock poisoned");
        Ok(items
            .iter()
            .filter(|((source, _), _)| source == source_identifier)
            .map(|(_, item)| item.clone())
            .collect())
    }
}
