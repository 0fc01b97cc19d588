//! Process-wide GPU memory accounting.
//!
//! Lock-free counters the pools report into; useful for budget dashboards
//! and for asserting that teardown returned everything.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of tracked allocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub allocation_count: usize,
    pub allocated_bytes: u64,
    pub peak_bytes: u64,
}

/// Atomic registry behind `global_metrics()`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    allocation_count: AtomicUsize,
    allocated_bytes: AtomicU64,
    peak_bytes: AtomicU64,
}

impl MetricsRegistry {
    pub const fn new() -> Self {
        Self {
            allocation_count: AtomicUsize::new(0),
            allocated_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
        }
    }

    pub fn track_allocation(&self, size: u64) {
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        let now = self.allocated_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(now, Ordering::Relaxed);
    }

    pub fn track_free(&self, size: u64) {
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MemoryMetrics {
        MemoryMetrics {
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

static GLOBAL: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

/// The registry every pool reports into.
pub fn global_metrics() -> &'static MetricsRegistry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_peak() {
        let registry = MetricsRegistry::new();
        registry.track_allocation(100);
        registry.track_allocation(50);
        registry.track_free(100);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.allocation_count, 1);
        assert_eq!(snapshot.allocated_bytes, 50);
        assert_eq!(snapshot.peak_bytes, 150);
    }
}
