use async_trait::async_trait;

use crate::error::CoordResult;
use crate::types::PartitionItem;

/// Persistent partition table shared by every node of a fleet.
///
/// The only concurrency primitive required of a backend is the conditional
/// update in [`try_update_item`](Self::try_update_item).
#[async_trait]
pub trait SourceCoordinationStore: Send + Sync {
    async fn get_item(
        &self,
        source_identifier: &str,
        partition_key: &str,
    ) -> CoordResult<Option<PartitionItem>>;

    /// Insert a new item. Returns `false` if the key already exists.
    async fn try_create_item(&self, item: PartitionItem) -> CoordResult<bool>;

    /// Replace the stored item if its version still equals `item.version`.
    ///
    /// Returns the stored item with its bumped version, or
    /// [`CoordError::ConditionalUpdateFailed`](crate::CoordError::ConditionalUpdateFailed)
    /// when another writer got there first.
    async fn try_update_item(&self, item: PartitionItem) -> CoordResult<PartitionItem>;

    /// Every item of a source, ordered by partition key.
    async fn list_items(&self, source_identifier: &str) -> CoordResult<Vec<PartitionItem>>;
}
