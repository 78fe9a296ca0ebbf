use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Hardware monitor snapshot for one device. Fields are zero when the
/// platform cannot report them.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HwMonitor {
    pub temp_c: u32,
    pub fan_pct: u32,
}

/// Cumulative processed-hash counter shared between a worker and the
/// telemetry consumer. Incremented once per dispatched batch.
#[derive(Debug, Default)]
pub struct HashCounter(AtomicU64);

impl HashCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, hashes: u64) {
        self.0.fetch_add(hashes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Drains the counter, returning hashes accumulated since the last take.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_and_drains() {
        let counter = HashCounter::new();
        counter.add(16);
        counter.add(32);
        assert_eq!(counter.total(), 48);
        assert_eq!(counter.take(), 48);
        assert_eq!(counter.total(), 0);
    }
}
