//! In-process content-addressed blob backend.
//!
//! Implements the core [`BlobStore`] contract for single-process
//! deployments and tests: addresses are hex SHA-256 of content, tags are
//! kept alongside the bytes, retention is epoch-based with a lazy sweep,
//! and `list` paginates with an opaque cursor. Fault hooks let tests
//! exercise the retry and partial-failure paths of the core.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use memvault_core::blob::{
    content_address, content_hash_hex, BlobAddress, BlobObject, BlobStore, BlobTags, ListPage,
    PutReceipt,
};
use memvault_core::clock::{Clock, SystemClock};
use memvault_core::error::{Error, Result};

/// One epoch of retention, in milliseconds (one day by default).
pub const DEFAULT_EPOCH_MS: i64 = 86_400_000;

/// How many epochs a blob is retained by default.
pub const DEFAULT_RETENTION_EPOCHS: u64 = 30;

struct StoredBlob {
    bytes: Vec<u8>,
    tags: BlobTags,
    expires_epoch: u64,
}

#[derive(Default)]
struct Faults {
    /// Fail this many upcoming puts with `StorageUnavailable`.
    fail_puts: usize,
    /// Fail this many upcoming gets with `StorageUnavailable`.
    fail_gets: usize,
    /// Artificial latency applied to every operation.
    latency: Option<Duration>,
}

/// Operation counters (observability in tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCounters {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub swept: u64,
}

/// The in-memory backend.
pub struct InMemoryBlobStore {
    clock: Arc<dyn Clock>,
    epoch_ms: i64,
    retention_epochs: u64,
    blobs: RwLock<HashMap<BlobAddress, StoredBlob>>,
    faults: Mutex<Faults>,
    counters: Mutex<StoreCounters>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            epoch_ms: DEFAULT_EPOCH_MS,
            retention_epochs: DEFAULT_RETENTION_EPOCHS,
            blobs: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            counters: Mutex::new(StoreCounters::default()),
        }
    }

    /// Shorten epochs (tests of retention semantics).
    #[must_use]
    pub fn with_retention(mut self, epoch_ms: i64, retention_epochs: u64) -> Self {
        self.epoch_ms = epoch_ms.max(1);
        self.retention_epochs = retention_epochs.max(1);
        self
    }

    /// Fail the next `n` puts with `StorageUnavailable`.
    pub fn fail_next_puts(&self, n: usize) {
        self.faults.lock().fail_puts = n;
    }

    /// Fail the next `n` gets with `StorageUnavailable`.
    pub fn fail_next_gets(&self, n: usize) {
        self.faults.lock().fail_gets = n;
    }

    /// Apply artificial latency to every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    #[must_use]
    pub fn counters(&self) -> StoreCounters {
        *self.counters.lock()
    }

    /// Number of live blobs (after a sweep).
    #[must_use]
    pub fn len(&self) -> usize {
        self.sweep();
        self.blobs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current_epoch(&self) -> u64 {
        (self.clock.now_ms() / self.epoch_ms).max(0) as u64
    }

    /// Drop blobs whose retention epoch has lapsed.
    fn sweep(&self) {
        let epoch = self.current_epoch();
        let mut blobs = self.blobs.write();
        let before = blobs.len();
        blobs.retain(|_, blob| blob.expires_epoch >= epoch);
        let swept = before - blobs.len();
        if swept > 0 {
            self.counters.lock().swept += swept as u64;
            debug!(swept, "retention sweep dropped expired blobs");
        }
    }

    async fn apply_latency(&self) {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, mut tags: BlobTags) -> Result<PutReceipt> {
        self.apply_latency().await;
        {
            let mut faults = self.faults.lock();
            if faults.fail_puts > 0 {
                faults.fail_puts -= 1;
                return Err(Error::StorageUnavailable("injected put failure".into()));
            }
        }
        self.sweep();

        let address = content_address(&bytes);
        let size = bytes.len() as u64;
        tags.content_hash = content_hash_hex(&bytes);
        tags.content_size = size;

        let now = self.clock.now_ms();
        let expires_epoch = self.current_epoch() + self.retention_epochs;
        self.blobs.write().insert(
            address.clone(),
            StoredBlob {
                bytes,
                tags,
                expires_epoch,
            },
        );
        self.counters.lock().puts += 1;

        Ok(PutReceipt {
            address,
            size,
            stored_at: now,
            retention_epoch_end: expires_epoch,
        })
    }

    async fn get(&self, address: &BlobAddress) -> Result<BlobObject> {
        self.apply_latency().await;
        {
            let mut faults = self.faults.lock();
            if faults.fail_gets > 0 {
                faults.fail_gets -= 1;
                return Err(Error::StorageUnavailable("injected get failure".into()));
            }
        }
        self.sweep();
        self.counters.lock().gets += 1;

        self.blobs
            .read()
            .get(address)
            .map(|blob| BlobObject {
                bytes: blob.bytes.clone(),
                tags: blob.tags.clone(),
            })
            .ok_or_else(|| Error::not_found(format!("blob {address}")))
    }

    async fn head(&self, address: &BlobAddress) -> Result<Option<BlobTags>> {
        self.apply_latency().await;
        self.sweep();
        Ok(self.blobs.read().get(address).map(|blob| blob.tags.clone()))
    }

    async fn delete(&self, address: &BlobAddress) -> Result<bool> {
        self.apply_latency().await;
        self.counters.lock().deletes += 1;
        Ok(self.blobs.write().remove(address).is_some())
    }

    async fn list(
        &self,
        owner: &str,
        tag_filter: Option<(&str, &str)>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        self.apply_latency().await;
        self.sweep();

        let matches_filter = |tags: &BlobTags| match tag_filter {
            None => true,
            Some(("category", value)) => tags.category == value,
            Some(("content_type", value)) => tags.content_type == value,
            Some(("is_encrypted", value)) => tags.is_encrypted.to_string() == value,
            Some((key, value)) => tags.extra.get(key).is_some_and(|v| v == value),
        };

        let blobs = self.blobs.read();
        let mut addresses: Vec<BlobAddress> = blobs
            .iter()
            .filter(|(_, blob)| blob.tags.owner == owner && matches_filter(&blob.tags))
            .map(|(address, _)| address.clone())
            .collect();
        addresses.sort();

        let start = match cursor {
            Some(cursor) => addresses
                .iter()
                .position(|a| a.as_str() > cursor)
                .unwrap_or(addresses.len()),
            None => 0,
        };
        let limit = limit.max(1);
        let page: Vec<BlobAddress> = addresses[start..].iter().take(limit).cloned().collect();
        let next_cursor = if start + page.len() < addresses.len() {
            page.last().map(|a| a.as_str().to_string())
        } else {
            None
        };

        Ok(ListPage {
            addresses: page,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn tags(owner: &str) -> BlobTags {
        BlobTags::internal(owner, "application/octet-stream")
    }

    #[tokio::test]
    async fn put_get_round_trip_is_content_addressed() {
        let store = InMemoryBlobStore::new();
        let receipt = store.put(b"payload".to_vec(), tags("0xa")).await.unwrap();
        let again = store.put(b"payload".to_vec(), tags("0xa")).await.unwrap();
        assert_eq!(receipt.address, again.address);

        let object = store.get(&receipt.address).await.unwrap();
        assert_eq!(object.bytes, b"payload");
        assert_eq!(object.tags.content_size, 7);
        assert!(!object.tags.content_hash.is_empty());
    }

    #[tokio::test]
    async fn get_unknown_address_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store
            .get(&BlobAddress::new("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_then_head_observes_absence() {
        let store = InMemoryBlobStore::new();
        let receipt = store.put(b"gone soon".to_vec(), tags("0xa")).await.unwrap();
        assert!(store.head(&receipt.address).await.unwrap().is_some());
        assert!(store.delete(&receipt.address).await.unwrap());
        assert!(store.head(&receipt.address).await.unwrap().is_none());
        assert!(!store.delete(&receipt.address).await.unwrap());
    }

    #[tokio::test]
    async fn retention_epochs_expire_blobs() {
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let store = InMemoryBlobStore::with_clock(clock.clone()).with_retention(1_000, 2);
        let receipt = store.put(b"ephemeral".to_vec(), tags("0xa")).await.unwrap();
        assert_eq!(receipt.retention_epoch_end, 2);

        clock.0.store(2_000, Ordering::SeqCst); // epoch 2: still retained
        assert!(store.head(&receipt.address).await.unwrap().is_some());

        clock.0.store(3_000, Ordering::SeqCst); // epoch 3: lapsed
        assert!(store.head(&receipt.address).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_owner_and_tag_and_paginates() {
        let store = InMemoryBlobStore::new();
        for i in 0..5u8 {
            let mut t = tags("0xa");
            t.category = if i % 2 == 0 { "even".into() } else { "odd".into() };
            store.put(vec![i; 4], t).await.unwrap();
        }
        store.put(b"other owner".to_vec(), tags("0xb")).await.unwrap();

        let all = store.list("0xa", None, 100, None).await.unwrap();
        assert_eq!(all.addresses.len(), 5);
        assert!(all.next_cursor.is_none());

        let evens = store
            .list("0xa", Some(("category", "even")), 100, None)
            .await
            .unwrap();
        assert_eq!(evens.addresses.len(), 3);

        // Cursor pagination covers everything exactly once.
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list("0xa", None, 2, cursor.as_deref())
                .await
                .unwrap();
            seen.extend(page.addresses.clone());
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let store = InMemoryBlobStore::new();
        store.fail_next_puts(1);
        let err = store.put(b"x".to_vec(), tags("0xa")).await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        // Next put succeeds.
        store.put(b"x".to_vec(), tags("0xa")).await.unwrap();
    }
}
