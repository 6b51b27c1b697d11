//! The tiered [`ContentCache`] implementation.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use crate::blob::{BlobAddress, BlobStore};
use crate::cache::types::{CacheEntry, CacheMetrics};
use crate::error::Result;
use crate::types::CacheConfig;

/// Byte-bounded insertion-ordered hot set (the L2 tier).
struct HotSet {
    map: HashMap<BlobAddress, CacheEntry>,
    order: VecDeque<BlobAddress>,
    resident_bytes: usize,
    capacity_bytes: usize,
}

impl HotSet {
    fn new(capacity_bytes: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            resident_bytes: 0,
            capacity_bytes,
        }
    }

    fn remove(&mut self, address: &BlobAddress) -> Option<CacheEntry> {
        let entry = self.map.remove(address)?;
        self.resident_bytes = self.resident_bytes.saturating_sub(entry.len());
        self.order.retain(|a| a != address);
        Some(entry)
    }

    /// Insert, evicting oldest entries until under the byte budget.
    /// Returns the number of evictions performed.
    fn insert(&mut self, address: BlobAddress, entry: CacheEntry) -> u64 {
        if entry.len() > self.capacity_bytes {
            // Entry alone exceeds the budget; L3 remains the source of truth.
            return 0;
        }
        if self.map.contains_key(&address) {
            self.remove(&address);
        }
        self.resident_bytes += entry.len();
        self.order.push_back(address.clone());
        self.map.insert(address, entry);

        let mut evictions = 0;
        while self.resident_bytes > self.capacity_bytes {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            if let Some(old) = self.map.remove(&victim) {
                self.resident_bytes = self.resident_bytes.saturating_sub(old.len());
                evictions += 1;
            }
        }
        evictions
    }
}

/// Three-tier content cache in front of the blob store.
///
/// On an L3 hit the bytes are inserted into L2 then L1; eviction from L1
/// demotes to L2; eviction from L2 drops the entry (the blob store remains
/// the source of truth).
pub struct ContentCache {
    l1: Mutex<LruCache<BlobAddress, CacheEntry>>,
    l2: Mutex<HotSet>,
    store: Arc<dyn BlobStore>,
    config: CacheConfig,
    metrics: Mutex<CacheMetrics>,
}

impl ContentCache {
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, config: CacheConfig) -> Self {
        let l1_capacity = NonZeroUsize::new(config.l1_entries.max(1)).unwrap();
        Self {
            l1: Mutex::new(LruCache::new(l1_capacity)),
            l2: Mutex::new(HotSet::new(config.l2_bytes)),
            store,
            config,
            metrics: Mutex::new(CacheMetrics::default()),
        }
    }

    /// Fetch bytes for an address, probing L1 → L2 → blob store.
    pub async fn get(&self, address: &BlobAddress) -> Result<Arc<Vec<u8>>> {
        let started = Instant::now();

        if let Some(bytes) = self.probe_l1(address) {
            self.finish_get(started);
            return Ok(bytes);
        }

        if let Some(bytes) = self.probe_l2_and_promote(address) {
            self.finish_get(started);
            return Ok(bytes);
        }

        // L3: the blob store is the source of truth.
        let object = self.store.get(address).await?;
        let bytes = Arc::new(object.bytes);
        {
            let mut metrics = self.metrics.lock();
            metrics.l3_fetches += 1;
        }
        self.admit(address.clone(), Arc::clone(&bytes));
        self.finish_get(started);
        Ok(bytes)
    }

    /// Warm the cache with bytes already in hand (e.g. right after `put`).
    pub fn insert(&self, address: BlobAddress, bytes: Arc<Vec<u8>>) {
        self.admit(address, bytes);
    }

    /// Snapshot of cache metrics.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let mut metrics = *self.metrics.lock();
        metrics.l1_entries = self.l1.lock().len();
        metrics.l2_bytes = self.l2.lock().resident_bytes;
        metrics
    }

    /// Drop all cached entries (L3 is untouched).
    pub fn clear(&self) {
        self.l1.lock().clear();
        let mut l2 = self.l2.lock();
        l2.map.clear();
        l2.order.clear();
        l2.resident_bytes = 0;
    }

    fn probe_l1(&self, address: &BlobAddress) -> Option<Arc<Vec<u8>>> {
        let mut l1 = self.l1.lock();
        let mut metrics = self.metrics.lock();
        match l1.get(address) {
            Some(entry) if !entry.is_expired(self.config.ttl) => {
                metrics.l1.hits += 1;
                Some(Arc::clone(&entry.bytes))
            }
            Some(_) => {
                l1.pop(address);
                metrics.l1.misses += 1;
                metrics.l1.evictions += 1;
                None
            }
            None => {
                metrics.l1.misses += 1;
                None
            }
        }
    }

    fn probe_l2_and_promote(&self, address: &BlobAddress) -> Option<Arc<Vec<u8>>> {
        let entry = {
            let mut l2 = self.l2.lock();
            let mut metrics = self.metrics.lock();
            match l2.remove(address) {
                Some(entry) if !entry.is_expired(self.config.ttl) => {
                    metrics.l2.hits += 1;
                    Some(entry)
                }
                Some(_) => {
                    metrics.l2.misses += 1;
                    metrics.l2.evictions += 1;
                    None
                }
                None => {
                    metrics.l2.misses += 1;
                    None
                }
            }
        }?;

        let bytes = Arc::clone(&entry.bytes);
        self.push_l1(address.clone(), entry);
        Some(bytes)
    }

    /// Insert into L2 then L1 (the promotion path for L3 hits and warm
    /// writes).
    fn admit(&self, address: BlobAddress, bytes: Arc<Vec<u8>>) {
        let entry = CacheEntry::new(bytes);
        {
            let mut l2 = self.l2.lock();
            let evicted = l2.insert(address.clone(), entry.clone());
            if evicted > 0 {
                self.metrics.lock().l2.evictions += evicted;
            }
        }
        self.push_l1(address, entry);
    }

    /// Push into L1, demoting the evicted entry (if any) to L2.
    fn push_l1(&self, address: BlobAddress, entry: CacheEntry) {
        let demoted = {
            let mut l1 = self.l1.lock();
            l1.push(address, entry)
        };
        if let Some((victim_addr, victim)) = demoted {
            let mut metrics = self.metrics.lock();
            metrics.l1.evictions += 1;
            drop(metrics);
            if !victim.is_expired(self.config.ttl) {
                let mut l2 = self.l2.lock();
                let evicted = l2.insert(victim_addr, victim);
                if evicted > 0 {
                    self.metrics.lock().l2.evictions += evicted;
                }
            }
        }
    }

    fn finish_get(&self, started: Instant) {
        let mut metrics = self.metrics.lock();
        metrics.get_count += 1;
        metrics.total_get_micros += started.elapsed().as_micros() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{content_hash_hex, BlobObject, BlobTags, ListPage, PutReceipt};
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Store stub that counts fetches.
    struct CountingStore {
        blobs: parking_lot::RwLock<HashMap<BlobAddress, Vec<u8>>>,
        fetches: AtomicU64,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                blobs: parking_lot::RwLock::new(HashMap::new()),
                fetches: AtomicU64::new(0),
            }
        }

        fn seed(&self, bytes: &[u8]) -> BlobAddress {
            let address = crate::blob::content_address(bytes);
            self.blobs.write().insert(address.clone(), bytes.to_vec());
            address
        }
    }

    #[async_trait]
    impl BlobStore for CountingStore {
        async fn put(&self, bytes: Vec<u8>, _tags: BlobTags) -> Result<PutReceipt> {
            let address = self.seed(&bytes);
            Ok(PutReceipt {
                address,
                size: bytes.len() as u64,
                stored_at: 0,
                retention_epoch_end: 1,
            })
        }

        async fn get(&self, address: &BlobAddress) -> Result<BlobObject> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let bytes = self
                .blobs
                .read()
                .get(address)
                .cloned()
                .ok_or_else(|| Error::not_found(address))?;
            let tags = BlobTags {
                content_hash: content_hash_hex(&bytes),
                content_size: bytes.len() as u64,
                ..BlobTags::internal("test", "application/octet-stream")
            };
            Ok(BlobObject { bytes, tags })
        }

        async fn head(&self, address: &BlobAddress) -> Result<Option<BlobTags>> {
            Ok(self
                .blobs
                .read()
                .get(address)
                .map(|_| BlobTags::internal("test", "application/octet-stream")))
        }

        async fn delete(&self, address: &BlobAddress) -> Result<bool> {
            Ok(self.blobs.write().remove(address).is_some())
        }

        async fn list(
            &self,
            _owner: &str,
            _tag_filter: Option<(&str, &str)>,
            _limit: usize,
            _cursor: Option<&str>,
        ) -> Result<ListPage> {
            Ok(ListPage::default())
        }
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            l1_entries: 2,
            l2_bytes: 64,
            ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let store = Arc::new(CountingStore::new());
        let address = store.seed(b"cached payload");
        let cache = ContentCache::new(store.clone(), small_config());

        let first = cache.get(&address).await.unwrap();
        let second = cache.get(&address).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        let metrics = cache.metrics();
        assert_eq!(metrics.l3_fetches, 1);
        assert_eq!(metrics.l1.hits, 1);
    }

    #[tokio::test]
    async fn l1_eviction_demotes_to_l2() {
        let store = Arc::new(CountingStore::new());
        let a = store.seed(b"aaaa");
        let b = store.seed(b"bbbb");
        let c = store.seed(b"cccc");
        let cache = ContentCache::new(store.clone(), small_config());

        // Fill L1 (capacity 2) then push a third entry; `a` demotes to L2.
        cache.get(&a).await.unwrap();
        cache.get(&b).await.unwrap();
        cache.get(&c).await.unwrap();

        let fetches_before = store.fetches.load(Ordering::SeqCst);
        cache.get(&a).await.unwrap();
        assert_eq!(
            store.fetches.load(Ordering::SeqCst),
            fetches_before,
            "demoted entry must be served from L2"
        );
        assert!(cache.metrics().l2.hits >= 1);
    }

    #[tokio::test]
    async fn l2_eviction_falls_back_to_store() {
        let store = Arc::new(CountingStore::new());
        let cache = ContentCache::new(
            store.clone(),
            CacheConfig {
                l1_entries: 1,
                l2_bytes: 8, // fits two 4-byte entries
                ttl: Duration::from_secs(3600),
            },
        );

        let addresses: Vec<_> = (0..4u8)
            .map(|i| store.seed(&[i, i, i, i]))
            .collect();
        for address in &addresses {
            cache.get(address).await.unwrap();
        }

        // The oldest entry has been dropped from both tiers by now.
        let fetches_before = store.fetches.load(Ordering::SeqCst);
        cache.get(&addresses[0]).await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), fetches_before + 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let store = Arc::new(CountingStore::new());
        let address = store.seed(b"short lived");
        let cache = ContentCache::new(
            store.clone(),
            CacheConfig {
                l1_entries: 4,
                l2_bytes: 1024,
                ttl: Duration::from_millis(0),
            },
        );

        cache.get(&address).await.unwrap();
        cache.get(&address).await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_insert_skips_first_fetch() {
        let store = Arc::new(CountingStore::new());
        let bytes = b"warm".to_vec();
        let address = store.seed(&bytes);
        let cache = ContentCache::new(store.clone(), small_config());

        cache.insert(address.clone(), Arc::new(bytes));
        cache.get(&address).await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
    }
}
