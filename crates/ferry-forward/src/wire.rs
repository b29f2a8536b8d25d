use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ferry_types::{Event, EventMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ForwardError, ForwardResult};

/// The envelope an event travels in between peers.
///
/// Carries just enough to rebuild the event on the receiving node. Event id
/// and acknowledgement state stay behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event_type: String,
    pub time_received: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    pub data: Value,
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        let metadata = event.metadata();
        Self {
            event_type: metadata.event_type().to_string(),
            time_received: metadata.time_received(),
            attributes: metadata.attributes().clone(),
            tags: metadata.tags().clone(),
            data: event.data().clone(),
        }
    }
}

impl WireEvent {
    pub fn into_event(self) -> ForwardResult<Event> {
        let builder = EventMetadata::builder(self.event_type)
            .time_received(self.time_received)
            .attributes(self.attributes);
        let metadata = self
            .tags
            .into_iter()
            .fold(builder, |b, tag| b.tag(tag))
            .build()
            .map_err(|e| ForwardError::Codec(e.to_string()))?;
        Ok(Event::from_parts(metadata, self.data))
    }
}

/// Events bound for one processor on one peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireBatch {
    pub plugin_id: String,
    pub events: Vec<WireEvent>,
}

impl WireBatch {
    pub fn new(plugin_id: impl Into<String>, events: &[Event]) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            events: events.iter().map(WireEvent::from).collect(),
        }
    }

    pub fn encode(&self) -> ForwardResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ForwardError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ForwardResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ForwardError::Codec(e.to_string()))
    }

    /// Rebuild every event; fails on the first malformed one.
    pub fn into_events(self) -> ForwardResult<Vec<Event>> {
        self.events.into_iter().map(WireEvent::into_event).collect()
    }
}
