use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TypeError;

/// Something that wants to hear when an event is released.
///
/// Acknowledgement sets implement this so a handle can notify every set the
/// event was added to without this crate knowing about sets.
pub trait ReleaseTarget: Send + Sync {
    fn on_release(&self, positive: bool);
}

#[derive(Default)]
struct HandleInner {
    released: AtomicBool,
    targets: Mutex<Vec<Arc<dyn ReleaseTarget>>>,
}

/// Per-event acknowledgement hook.
///
/// Cheap to clone; clones refer to the same underlying handle. The first
/// call to [`EventHandle::release`] notifies every attached target exactly
/// once. Later calls are no-ops.
#[derive(Clone, Default)]
pub struct EventHandle {
    inner: Arc<HandleInner>,
}

impl EventHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a target that will be notified on release.
    ///
    /// Fails with [`TypeError::HandleReleased`] if the handle was already
    /// released; the target is then never notified.
    pub fn attach(&self, target: Arc<dyn ReleaseTarget>) -> Result<(), TypeError> {
        let mut targets = self.inner.targets.lock().expect("handle lock poisoned");
        // Checked under the lock: release() sets the flag before it takes the
        // target list, so a target pushed here is always seen by release().
        if self.inner.released.load(Ordering::Acquire) {
            return Err(TypeError::HandleReleased);
        }
        targets.push(target);
        Ok(())
    }

    /// Release the event, positively (processed) or negatively (failed).
    ///
    /// Returns `true` if this call performed the release.
    pub fn release(&self, positive: bool) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let targets = std::mem::take(&mut *self.inner.targets.lock().expect("handle lock poisoned"));
        for target in targets {
            target.on_release(positive);
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Returns `true` if at least one target is waiting on this handle.
    pub fn is_tracked(&self) -> bool {
        !self.inner.targets.lock().expect("handle lock poisoned").is_empty()
    }

    /// Returns `true` if both values refer to the same handle.
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets = self
            .inner
            .targets
            .lock()
            .map(|t| t.len())
            .unwrap_or_default();
        f.debug_struct("EventHandle")
            .field("released", &self.is_released())
            .field("targets", &targets)
            .finish()
    }
}
