//! Three-tier content cache.
//!
//! Lookup path: L1 in-process LRU (entry-bounded) → L2 shared hot set
//! (byte-bounded) → L3 blob store. Addresses are content hashes, so cached
//! values never go stale; TTL only bounds working-set growth.
//!
//! - `types`: configuration, entries, metrics
//! - `tiered`: the [`ContentCache`] implementation

mod tiered;
mod types;

pub use tiered::ContentCache;
pub use types::{CacheMetrics, TierStats};
