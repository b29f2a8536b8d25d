use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Admission gate consulted before buffer writes and peer-forward sends.
///
/// `is_open` must be cheap and free of side effects. When it returns `true`
/// the caller applies its backpressure policy instead of blocking.
pub trait CircuitBreaker: Send + Sync {
    fn is_open(&self) -> bool;
}

/// A breaker that never trips. The default when no resource guard is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverOpen;

impl CircuitBreaker for NeverOpen {
    fn is_open(&self) -> bool {
        false
    }
}

/// A breaker tripped and reset explicitly by its owner.
#[derive(Debug, Default)]
pub struct ManualCircuitBreaker {
    open: AtomicBool,
}

impl ManualCircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl CircuitBreaker for ManualCircuitBreaker {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Opens while a sampled gauge (memory in use, queue depth, ...) is at or
/// above a threshold.
pub struct ThresholdCircuitBreaker {
    gauge: Box<dyn Fn() -> u64 + Send + Sync>,
    threshold: u64,
}

impl ThresholdCircuitBreaker {
    pub fn new(threshold: u64, gauge: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            gauge: Box::new(gauge),
            threshold,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl CircuitBreaker for ThresholdCircuitBreaker {
    fn is_open(&self) -> bool {
        (self.gauge)() >= self.threshold
    }
}

impl fmt::Debug for ThresholdCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdCircuitBreaker")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn never_open_is_closed() {
        assert!(!NeverOpen.is_open());
    }

    #[test]
    fn manual_trip_and_reset() {
        let breaker = ManualCircuitBreaker::new();
        assert!(!breaker.is_open());
        breaker.trip();
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
    }

    #[test]
    fn threshold_follows_gauge() {
        let usage = Arc::new(AtomicU64::new(10));
        let sampled = usage.clone();
        let breaker = ThresholdCircuitBreaker::new(100, move || sampled.load(Ordering::Relaxed));

        assert!(!breaker.is_open());
        usage.store(100, Ordering::Relaxed);
        assert!(breaker.is_open());
        usage.store(99, Ordering::Relaxed);
        assert!(!breaker.is_open());
    }
}
