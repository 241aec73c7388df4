//! `src/cache/stats.rs`
//! ============================================================
//! Cache statistics for monitoring and debugging.
//!
//! Running counters are relaxed atomics bumped from inside the store;
//! `CacheStatsSnapshot` adds the point-in-time figures (bytes, watcher
//! count, entry count) read under the cache lock.

use std::sync::atomic::{AtomicU64, Ordering};

use bytesize::ByteSize;

/// Monotonic event counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    enumerations: AtomicU64,
    evictions: AtomicU64,
    dirty_marks: AtomicU64,
    overflows: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enumeration(&self) {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dirty_mark(&self) {
        self.dirty_marks.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new total so the bridge can rate-limit its logging.
    pub fn record_overflow(&self) -> u64 {
        self.overflows.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn fill(&self, snapshot: &mut CacheStatsSnapshot) {
        snapshot.hits = self.hits.load(Ordering::Relaxed);
        snapshot.misses = self.misses.load(Ordering::Relaxed);
        snapshot.enumerations = self.enumerations.load(Ordering::Relaxed);
        snapshot.evictions = self.evictions.load(Ordering::Relaxed);
        snapshot.dirty_marks = self.dirty_marks.load(Ordering::Relaxed);
        snapshot.overflows = self.overflows.load(Ordering::Relaxed);
    }
}

/// Point-in-time view of the cache, for status bars and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    pub max_bytes: u64,
    pub current_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub enumerations: u64,
    pub evictions: u64,
    pub dirty_marks: u64,
    pub overflows: u64,
    pub active_watchers: usize,
    pub pinned_entries: usize,
    pub entry_count: usize,
}

impl CacheStatsSnapshot {
    #[expect(clippy::cast_precision_loss, reason = "Expected precision loss")]
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Human-readable occupancy, e.g. "12.4 MB / 256 MB".
    #[must_use]
    pub fn bytes_human(&self) -> String {
        format!(
            "{} / {}",
            ByteSize::b(self.current_bytes),
            ByteSize::b(self.max_bytes)
        )
    }
}
