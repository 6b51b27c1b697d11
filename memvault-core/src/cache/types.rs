//! Content-cache types and metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cached blob with its insertion time for TTL checks.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub bytes: Arc<Vec<u8>>,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub(crate) fn new(bytes: Arc<Vec<u8>>) -> Self {
        Self {
            bytes,
            inserted_at: Instant::now(),
        }
    }

    pub(crate) fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Hit/miss/eviction counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl TierStats {
    /// Hit rate in `[0, 1]`; zero when the tier has not been probed.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Aggregate cache metrics surfaced through `stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub l1: TierStats,
    pub l2: TierStats,
    /// Fetches that went all the way to the blob store.
    pub l3_fetches: u64,
    /// Total time spent in `get`, microseconds.
    pub total_get_micros: u64,
    pub get_count: u64,
    /// Current L1 entry count.
    pub l1_entries: usize,
    /// Current L2 resident bytes.
    pub l2_bytes: usize,
}

impl CacheMetrics {
    /// Mean retrieval time per `get`, microseconds.
    #[must_use]
    pub fn mean_get_micros(&self) -> f64 {
        if self.get_count == 0 {
            0.0
        } else {
            self.total_get_micros as f64 / self.get_count as f64
        }
    }

    /// Overall hit rate: fraction of gets served without an L3 fetch.
    #[must_use]
    pub fn overall_hit_rate(&self) -> f64 {
        if self.get_count == 0 {
            0.0
        } else {
            1.0 - self.l3_fetches as f64 / self.get_count as f64
        }
    }
}
