use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::handle::EventHandle;

/// Unique identifier for an event (UUID v7, so ids sort by creation time).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(uuid::Uuid);

impl EventId {
    /// Generate a new time-ordered identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt:{}", self.0.simple())
    }
}

/// Metadata attached to every [`Event`].
///
/// Built once through [`EventMetadataBuilder`]. Afterwards only tags and
/// attributes may change, which processors use to annotate events before
/// they are forwarded or written to a sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    event_type: String,
    time_received: DateTime<Utc>,
    attributes: BTreeMap<String, Value>,
    tags: BTreeSet<String>,
    external_origination_time: Option<DateTime<Utc>>,
}

impl EventMetadata {
    /// Start building metadata for the given event type.
    pub fn builder(event_type: impl Into<String>) -> EventMetadataBuilder {
        EventMetadataBuilder {
            event_type: event_type.into(),
            time_received: None,
            attributes: BTreeMap::new(),
            tags: BTreeSet::new(),
            external_origination_time: None,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn time_received(&self) -> DateTime<Utc> {
        self.time_received
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
    }

    /// Returns `true` if every given tag is present.
    pub fn has_tags(&self, tags: &[&str]) -> bool {
        tags.iter().all(|t| self.tags.contains(*t))
    }

    pub fn external_origination_time(&self) -> Option<DateTime<Utc>> {
        self.external_origination_time
    }
}

/// Builder for [`EventMetadata`].
#[derive(Clone, Debug)]
pub struct EventMetadataBuilder {
    event_type: String,
    time_received: Option<DateTime<Utc>>,
    attributes: BTreeMap<String, Value>,
    tags: BTreeSet<String>,
    external_origination_time: Option<DateTime<Utc>>,
}

impl EventMetadataBuilder {
    pub fn time_received(mut self, at: DateTime<Utc>) -> Self {
        self.time_received = Some(at);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn external_origination_time(mut self, at: DateTime<Utc>) -> Self {
        self.external_origination_time = Some(at);
        self
    }

    /// Finish the metadata. `time_received` defaults to now.
    pub fn build(self) -> Result<EventMetadata, TypeError> {
        if self.event_type.trim().is_empty() {
            return Err(TypeError::EmptyEventType);
        }
        Ok(EventMetadata {
            event_type: self.event_type,
            time_received: self.time_received.unwrap_or_else(Utc::now),
            attributes: self.attributes,
            tags: self.tags,
            external_origination_time: self.external_origination_time,
        })
    }
}

/// A structured unit of data flowing through the pipeline.
///
/// The JSON `data` body is addressed with slash-separated keys
/// (`"user/id"` or `"/user/id"`). The [`EventHandle`] is process-local: it
/// is shared by clones of the event and is never serialized, so an event
/// decoded from the wire or a log starts with a fresh, untracked handle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    metadata: EventMetadata,
    data: Value,
    #[serde(skip)]
    handle: EventHandle,
}

impl Event {
    /// Create an event of the given type, received now.
    pub fn new(event_type: impl Into<String>, data: Value) -> Result<Self, TypeError> {
        let metadata = EventMetadata::builder(event_type).build()?;
        Ok(Self::from_parts(metadata, data))
    }

    pub fn from_parts(metadata: EventMetadata, data: Value) -> Self {
        Self {
            id: EventId::new(),
            metadata,
            data,
            handle: EventHandle::new(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut EventMetadata {
        &mut self.metadata
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub fn handle(&self) -> &EventHandle {
        &self.handle
    }

    /// Look up a value by slash-separated key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let segments = split_key(key).ok()?;
        let mut current = &self.data;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Write a value at a slash-separated key, creating intermediate objects.
    pub fn put(&mut self, key: &str, value: Value) -> Result<(), TypeError> {
        let segments = split_key(key)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| TypeError::InvalidKey(key.to_string()))?;

        if self.data.is_null() {
            self.data = Value::Object(Map::new());
        }
        let mut current = &mut self.data;
        for segment in parents {
            let object = current
                .as_object_mut()
                .ok_or_else(|| TypeError::PathConflict { key: key.to_string() })?;
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        current
            .as_object_mut()
            .ok_or_else(|| TypeError::PathConflict { key: key.to_string() })?
            .insert(last.to_string(), value);
        Ok(())
    }

    /// Remove and return the value at a slash-separated key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let segments = split_key(key).ok()?;
        let (last, parents) = segments.split_last()?;
        let mut current = &mut self.data;
        for segment in parents {
            current = current.as_object_mut()?.get_mut(*segment)?;
        }
        current.as_object_mut()?.remove(*last)
    }
}

impl PartialEq for Event {
    // The handle is process-local bookkeeping, not part of the event's value.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.metadata == other.metadata && self.data == other.data
    }
}

fn split_key(key: &str) -> Result<Vec<&str>, TypeError> {
    let trimmed = key.strip_prefix('/').unwrap_or(key);
    if trimmed.is_empty() {
        return Err(TypeError::InvalidKey(key.to_string()));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TypeError::InvalidKey(key.to_string()));
    }
    Ok(segments)
}
