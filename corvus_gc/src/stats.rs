//! GC statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics about allocation and collection activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of completed collections.
    pub collections: AtomicU64,
    /// Total objects reclaimed.
    pub objects_freed: AtomicU64,
    /// Live objects after the most recent collection.
    pub live_objects: AtomicU64,
    /// Total time spent collecting (nanoseconds).
    pub gc_time_ns: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            objects_allocated: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            objects_freed: AtomicU64::new(0),
            live_objects: AtomicU64::new(0),
            gc_time_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_allocation(&self, bytes: usize) {
        self.bytes_allocated
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection(&self, freed: usize, live: usize, elapsed: Duration) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.objects_freed.fetch_add(freed as u64, Ordering::Relaxed);
        self.live_objects.store(live as u64, Ordering::Relaxed);
        self.gc_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Number of completed collections.
    #[inline]
    pub fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            objects_freed: self.objects_freed.load(Ordering::Relaxed),
            live_objects: self.live_objects.load(Ordering::Relaxed),
            gc_time: Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed)),
        }
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    pub bytes_allocated: u64,
    pub objects_allocated: u64,
    pub collections: u64,
    pub objects_freed: u64,
    pub live_objects: u64,
    pub gc_time: Duration,
}
