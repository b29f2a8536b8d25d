use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    Unassigned,
    Assigned,
    Closed,
    Completed,
}

/// A partition as persisted in the coordination store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionItem {
    pub source_identifier: String,
    pub partition_key: String,
    pub status: PartitionStatus,
    pub owner: Option<String>,
    pub ownership_expires_at: Option<DateTime<Utc>>,
    /// Opaque progress blob owned by the source.
    pub progress_state: Option<Value>,
    pub closed_count: u32,
    /// When a closed partition becomes claimable again. `None` keeps it closed.
    pub reopen_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful update.
    pub version: u64,
}

impl PartitionItem {
    pub fn new(
        source_identifier: impl Into<String>,
        partition_key: impl Into<String>,
        progress_state: Option<Value>,
    ) -> Self {
        Self {
            source_identifier: source_identifier.into(),
            partition_key: partition_key.into(),
            status: PartitionStatus::Unassigned,
            owner: None,
            ownership_expires_at: None,
            progress_state,
            closed_count: 0,
            reopen_at: None,
            version: 0,
        }
    }

    /// Whether any node may claim this partition at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PartitionStatus::Unassigned => true,
            PartitionStatus::Closed => self.reopen_at.is_some_and(|at| at <= now),
            PartitionStatus::Assigned => self.ownership_expires_at.map_or(true, |at| at <= now),
            PartitionStatus::Completed => false,
        }
    }

    /// Whether `owner` holds a live lease at `now`.
    pub fn is_owned_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.status == PartitionStatus::Assigned
            && self.owner.as_deref() == Some(owner)
            && self.ownership_expires_at.is_some_and(|at| at > now)
    }

    /// Drop ownership fields, leaving status to the caller.
    pub(crate) fn clear_ownership(&mut self) {
        self.owner = None;
        self.ownership_expires_at = None;
    }
}

/// A partition handed to a source by [`crate::SourceCoordinator::get_next_partition`].
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    key: String,
    progress_state: Option<Value>,
    lease_expires_at: DateTime<Utc>,
}

impl Partition {
    pub(crate) fn new(key: String, progress_state: Option<Value>, lease_expires_at: DateTime<Utc>) -> Self {
        Self {
            key,
            progress_state,
            lease_expires_at,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Progress saved by the previous owner, if any.
    pub fn progress_state(&self) -> Option<&Value> {
        self.progress_state.as_ref()
    }

    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        self.lease_expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn claimability_by_status() {
        let now = Utc::now();
        let mut item = PartitionItem::new("src", "p", None);
        assert!(item.is_claimable(now));

        item.status = PartitionStatus::Assigned;
        item.owner = Some("a".into());
        item.ownership_expires_at = Some(now + Duration::seconds(10));
        assert!(!item.is_claimable(now));
        assert!(item.is_owned_by("a", now));
        assert!(!item.is_owned_by("b", now));
        assert!(item.is_claimable(now + Duration::seconds(11)));
        assert!(!item.is_owned_by("a", now + Duration::seconds(11)));

        item.status = PartitionStatus::Closed;
        item.reopen_at = None;
        assert!(!item.is_claimable(now));
        item.reopen_at = Some(now);
        assert!(item.is_claimable(now));

        item.status = PartitionStatus::Completed;
        assert!(!item.is_claimable(now + Duration::days(1)));
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&PartitionStatus::Unassigned).unwrap();
        assert_eq!(json, "\"UNASSIGNED\"");
    }
}
