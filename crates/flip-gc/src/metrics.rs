//! Collection metrics.
//!
//! Each collection records a snapshot of what it did; the most recent
//! snapshot is available through [`last_gc_metrics`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Wall-clock duration of the collection.
    pub duration: Duration,
    /// Objects forwarded into the new half-space.
    pub objects_copied: usize,
    /// Unreachable objects reaped.
    pub objects_reclaimed: usize,
    /// Objects promoted out of the managed heap.
    pub objects_promoted: usize,
    /// Payload bytes moved.
    pub bytes_copied: usize,
    /// Collections since process start.
    pub total_collections: usize,
}

impl GcMetrics {
    /// A zeroed snapshot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            objects_copied: 0,
            objects_reclaimed: 0,
            objects_promoted: 0,
            bytes_copied: 0,
            total_collections: 0,
        }
    }
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static TOTAL_COLLECTIONS: AtomicUsize = AtomicUsize::new(0);
static LAST: Mutex<GcMetrics> = Mutex::new(GcMetrics::new());

/// Stores the snapshot of a finished collection.
pub(crate) fn record_collection(mut metrics: GcMetrics) {
    metrics.total_collections = TOTAL_COLLECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    *LAST.lock() = metrics;
}

/// The snapshot of the most recent collection, or a zeroed one if none has
/// run yet.
#[must_use]
pub fn last_gc_metrics() -> GcMetrics {
    *LAST.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_bumps_the_collection_count() {
        let before = last_gc_metrics().total_collections;
        record_collection(GcMetrics {
            objects_copied: 3,
            ..GcMetrics::new()
        });
        let after = last_gc_metrics();
        assert!(after.total_collections > before);
        assert_eq!(after.objects_copied, 3);
    }
}
