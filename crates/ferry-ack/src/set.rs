use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ferry_types::{Event, EventHandle, ReleaseTarget};
use tracing::{debug, warn};

use crate::error::{AckError, AckResult};

/// Completion callback. Receives `true` on success, `false` on failure or expiry.
pub type AckCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckSetId(uuid::Uuid);

impl AckSetId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for AckSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AckSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckSetId({})", self.0)
    }
}

impl fmt::Display for AckSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ack:{}", self.0.simple())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckSetStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl AckSetStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct SetState {
    pending: usize,
    added: usize,
    sealed: bool,
    status: AckSetStatus,
    callback: Option<AckCallback>,
}

struct SetInner {
    id: AckSetId,
    expires_at: Instant,
    state: Mutex<SetState>,
}

/// Outcome decided under the lock and delivered after it is released.
type Settled = Option<(AckCallback, bool)>;

impl SetInner {
    fn lock(&self) -> MutexGuard<'_, SetState> {
        self.state.lock().expect("ack set lock poisoned")
    }

    /// Move to `status` and hand back the callback. Caller holds the lock.
    fn settle(&self, state: &mut SetState, status: AckSetStatus) -> Settled {
        state.status = status;
        match status {
            AckSetStatus::Completed => {
                debug!(set = %self.id, events = state.added, "acknowledgement set completed")
            }
            AckSetStatus::Expired => warn!(
                set = %self.id,
                pending = state.pending,
                "acknowledgement set expired before all events were released"
            ),
            AckSetStatus::Failed => {
                debug!(set = %self.id, "acknowledgement set failed on negative release")
            }
            AckSetStatus::Pending => {}
        }
        let success = status == AckSetStatus::Completed;
        state.callback.take().map(|cb| (cb, success))
    }

    /// Complete or expire once sealed and drained.
    fn settle_if_done(&self, state: &mut SetState, now: Instant) -> Settled {
        if state.status.is_terminal() {
            return None;
        }
        if now >= self.expires_at {
            return self.settle(state, AckSetStatus::Expired);
        }
        if state.sealed && state.pending == 0 {
            return self.settle(state, AckSetStatus::Completed);
        }
        None
    }
}

fn deliver(settled: Settled) {
    if let Some((callback, success)) = settled {
        callback(success);
    }
}

impl ReleaseTarget for SetInner {
    fn on_release(&self, positive: bool) {
        let settled = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return;
            }
            if positive {
                state.pending = state.pending.saturating_sub(1);
                self.settle_if_done(&mut state, Instant::now())
            } else {
                self.settle(&mut state, AckSetStatus::Failed)
            }
        };
        deliver(settled);
    }
}

/// A cohort of events whose end-to-end completion is tracked together.
///
/// Cheap to clone; clones share state. The callback fires at most once and
/// never while an internal lock is held, so it may call back into the set.
#[derive(Clone)]
pub struct AcknowledgementSet {
    inner: Arc<SetInner>,
}

impl AcknowledgementSet {
    pub(crate) fn new(callback: AckCallback, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SetInner {
                id: AckSetId::new(),
                expires_at: Instant::now() + timeout,
                state: Mutex::new(SetState {
                    pending: 0,
                    added: 0,
                    sealed: false,
                    status: AckSetStatus::Pending,
                    callback: Some(callback),
                }),
            }),
        }
    }

    pub fn id(&self) -> AckSetId {
        self.inner.id
    }

    pub fn expires_at(&self) -> Instant {
        self.inner.expires_at
    }

    pub fn status(&self) -> AckSetStatus {
        self.inner.lock().status
    }

    /// Events added and not yet released.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    /// Track `handle`; its release will count against this set.
    pub fn add(&self, handle: &EventHandle) -> AckResult<()> {
        {
            let mut state = self.inner.lock();
            if state.status.is_terminal() {
                return Err(AckError::SetTerminal {
                    id: self.inner.id,
                    status: state.status,
                });
            }
            if state.sealed {
                return Err(AckError::SetSealed(self.inner.id));
            }
            // Counted before attaching so a release racing the attach cannot
            // drive the count below zero.
            state.pending += 1;
            state.added += 1;
        }

        if handle.attach(self.inner.clone()).is_err() {
            let settled = {
                let mut state = self.inner.lock();
                state.pending -= 1;
                state.added -= 1;
                self.inner.settle_if_done(&mut state, Instant::now())
            };
            deliver(settled);
            return Err(AckError::HandleReleased);
        }
        Ok(())
    }

    pub fn add_event(&self, event: &Event) -> AckResult<()> {
        self.add(event.handle())
    }

    /// Seal the set. It completes once every added event is released.
    ///
    /// Sealing twice is allowed; sealing a terminal set is an error.
    pub fn complete(&self) -> AckResult<()> {
        let settled = {
            let mut state = self.inner.lock();
            if state.status.is_terminal() {
                return Err(AckError::SetTerminal {
                    id: self.inner.id,
                    status: state.status,
                });
            }
            state.sealed = true;
            self.inner.settle_if_done(&mut state, Instant::now())
        };
        deliver(settled);
        Ok(())
    }

    /// Expire the set if its deadline has passed. Returns `true` if this
    /// call expired it.
    pub(crate) fn expire_if_due(&self, now: Instant) -> bool {
        if now < self.inner.expires_at {
            return false;
        }
        let settled = {
            let mut state = self.inner.lock();
            if state.status.is_terminal() {
                return false;
            }
            self.inner.settle(&mut state, AckSetStatus::Expired)
        };
        deliver(settled);
        true
    }
}

impl fmt::Debug for AcknowledgementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AcknowledgementSet")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("pending", &state.pending)
            .field("sealed", &state.sealed)
            .finish()
    }
}
