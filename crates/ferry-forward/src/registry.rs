use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ferry_buffer::Buffer;
use ferry_types::Event;

/// Receive buffers of forwarding processors, keyed by plugin id.
///
/// The server writes batches arriving from peers into these buffers; each
/// processor's forwarder drains its own.
#[derive(Default)]
pub struct ReceiveBufferRegistry {
    buffers: RwLock<HashMap<String, Arc<dyn Buffer<Event>>>>,
}

impl ReceiveBufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the buffer for `plugin_id`.
    pub fn register(&self, plugin_id: impl Into<String>, buffer: Arc<dyn Buffer<Event>>) {
        self.buffers
            .write()
            .expect("receive registry lock poisoned")
            .insert(plugin_id.into(), buffer);
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<dyn Buffer<Event>>> {
        self.buffers
            .read()
            .expect("receive registry lock poisoned")
            .get(plugin_id)
            .cloned()
    }

    pub fn remove(&self, plugin_id: &str) -> Option<Arc<dyn Buffer<Event>>> {
        self.buffers
            .write()
            .expect("receive registry lock poisoned")
            .remove(plugin_id)
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .buffers
            .read()
            .expect("receive registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
