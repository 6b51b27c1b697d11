//! Vector index manager: one warm HNSW index per active user.
//!
//! Lifecycle per user: cold (no in-memory state) → loading (single-flight
//! snapshot hydration) → warm (accepting adds and searches) → flushing
//! (snapshot write) → evicted back to cold after idling. Mutation is
//! serialised through the slot's write lock; searches share read guards
//! against the warm structure.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::blob::{BlobAddress, BlobStore, BlobTags};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::index::hnsw::{HnswIndex, HnswParams, VectorHit, VectorMeta};
use crate::index::ef_for_k;
use crate::types::{IndexConfig, MemoryId, UserAddress};

/// Content type tag for index snapshot blobs.
pub const SNAPSHOT_CONTENT_TYPE: &str = "application/x-memvault-index";

/// One queued vector add flowing through the `vec-add:<user>` batch kind.
#[derive(Debug, Clone)]
pub struct VecAdd {
    pub user: UserAddress,
    pub vector_id: u64,
    pub vector: Arc<Vec<f32>>,
    pub memory_id: MemoryId,
}

struct WarmIndex {
    index: HnswIndex,
    /// Adds since the last durable snapshot.
    dirty: usize,
    last_used: Instant,
    last_add: Instant,
    snapshot_ref: Option<BlobAddress>,
}

#[derive(Default)]
struct UserSlot {
    /// `None` = cold. Writers (adds, flush bookkeeping) take the write
    /// guard; searches take read guards.
    warm: RwLock<Option<WarmIndex>>,
    /// Single-flight guard for snapshot hydration.
    load_flight: tokio::sync::Mutex<()>,
}

/// Per-user stats row.
#[derive(Debug, Clone)]
pub struct UserIndexStats {
    pub user: UserAddress,
    pub warm: bool,
    pub size: usize,
    pub pending_snapshot: usize,
    pub snapshot_ref: Option<BlobAddress>,
}

/// Aggregate stats for the stats surface.
#[derive(Debug, Clone, Default)]
pub struct IndexManagerStats {
    pub users: Vec<UserIndexStats>,
    pub snapshots_written: u64,
    pub snapshot_failures: u64,
}

/// Manages one ANN index per user with durable snapshots in the blob store.
pub struct VectorIndexManager {
    store: Arc<dyn BlobStore>,
    clock: SharedClock,
    config: IndexConfig,
    dimension: usize,
    slots: Mutex<HashMap<UserAddress, Arc<UserSlot>>>,
    counters: Mutex<(u64, u64)>,
}

impl VectorIndexManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn BlobStore>,
        clock: SharedClock,
        config: IndexConfig,
        dimension: usize,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            dimension,
            slots: Mutex::new(HashMap::new()),
            counters: Mutex::new((0, 0)),
        }
    }

    fn slot(&self, user: &UserAddress) -> Arc<UserSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(user.clone()).or_default())
    }

    fn params(&self) -> HnswParams {
        HnswParams {
            dimension: self.dimension,
            m: self.config.m,
            ef_construction: self.config.ef_construction,
            ef_search_default: self.config.ef_search_default,
        }
    }

    /// Ensure the user's index is warm, hydrating the latest snapshot if one
    /// exists. Concurrent callers block on the same load (single flight).
    async fn ensure_warm(&self, user: &UserAddress) -> Result<Arc<UserSlot>> {
        let slot = self.slot(user);
        if slot.warm.read().await.is_some() {
            return Ok(slot);
        }

        let flight_slot = Arc::clone(&slot);
        let _flight = flight_slot.load_flight.lock().await;
        // Re-check: another caller may have finished the load while we
        // waited on the flight guard.
        if slot.warm.read().await.is_some() {
            return Ok(slot);
        }

        let (index, snapshot_ref) = match self.latest_snapshot(user).await? {
            Some(address) => {
                let object = self.store.get(&address).await?;
                let index = HnswIndex::from_snapshot(&object.bytes).map_err(|reason| {
                    Error::IndexCorrupted {
                        user: user.to_string(),
                        reason,
                    }
                })?;
                info!(user = %user, size = index.len(), "hydrated index snapshot");
                (index, Some(address))
            }
            None => {
                debug!(user = %user, "creating empty index");
                (HnswIndex::new(self.params(), seed_for(user)), None)
            }
        };

        let now = Instant::now();
        *slot.warm.write().await = Some(WarmIndex {
            index,
            dirty: 0,
            last_used: now,
            last_add: now,
            snapshot_ref,
        });
        Ok(slot)
    }

    /// Insert a batch of adds into the user's warm index. Called by the
    /// `vec-add:<user>` batch processor; the batcher is the single writer
    /// for a given user.
    #[instrument(skip(self, adds), fields(user = %user, count = adds.len()))]
    pub async fn add_batch(&self, user: &UserAddress, adds: Vec<VecAdd>) -> Result<()> {
        if adds.is_empty() {
            return Ok(());
        }
        let slot = self.ensure_warm(user).await?;
        let mut guard = slot.warm.write().await;
        let Some(warm) = guard.as_mut() else {
            // Evicted between ensure and lock; re-warm and retry once.
            drop(guard);
            return Box::pin(self.add_batch(user, adds)).await;
        };

        for add in adds {
            let meta = VectorMeta {
                memory_id: add.memory_id,
            };
            match warm.index.insert(add.vector_id, (*add.vector).clone(), meta) {
                Ok(()) => warm.dirty += 1,
                // Replays may re-offer vectors already in the snapshot.
                Err(Error::InvalidState(_)) => {
                    debug!(user = %user, vector_id = add.vector_id, "skipping duplicate add");
                }
                Err(e) => return Err(e),
            }
        }
        warm.last_add = Instant::now();
        warm.last_used = warm.last_add;
        Ok(())
    }

    /// ANN search over the user's index.
    pub async fn search(
        &self,
        user: &UserAddress,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let slot = self.ensure_warm(user).await?;
        {
            let mut guard = slot.warm.write().await;
            if let Some(warm) = guard.as_mut() {
                warm.last_used = Instant::now();
            }
        }
        let guard = slot.warm.read().await;
        let Some(warm) = guard.as_ref() else {
            drop(guard);
            return Box::pin(self.search(user, query, k)).await;
        };
        let ef = ef_for_k(k, self.config.ef_search_default);
        Ok(warm.index.search(query, k, ef))
    }

    /// Whether the user's index currently holds a live entry for an id.
    pub async fn contains(&self, user: &UserAddress, vector_id: u64) -> Result<bool> {
        let slot = self.ensure_warm(user).await?;
        let guard = slot.warm.read().await;
        Ok(guard
            .as_ref()
            .is_some_and(|warm| warm.index.contains(vector_id)))
    }

    /// Soft-delete one vector.
    pub async fn remove(&self, user: &UserAddress, vector_id: u64) -> Result<bool> {
        let slot = self.ensure_warm(user).await?;
        let mut guard = slot.warm.write().await;
        let Some(warm) = guard.as_mut() else {
            drop(guard);
            return Box::pin(self.remove(user, vector_id)).await;
        };
        let removed = warm.index.remove(vector_id);
        if removed {
            warm.dirty += 1;
        }
        Ok(removed)
    }

    /// Write the user's current index to a durable snapshot.
    ///
    /// On failure the warm index and the previous `snapshot_ref` are left
    /// untouched; the next policy trigger retries.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn flush(&self, user: &UserAddress) -> Result<Option<BlobAddress>> {
        let slot = self.ensure_warm(user).await?;

        let (bytes, captured_dirty) = {
            let guard = slot.warm.read().await;
            let Some(warm) = guard.as_ref() else {
                drop(guard);
                return Box::pin(self.flush(user)).await;
            };
            if warm.dirty == 0 {
                return Ok(warm.snapshot_ref.clone());
            }
            (warm.index.to_snapshot()?, warm.dirty)
        };

        let mut tags = BlobTags::internal(user.as_str(), SNAPSHOT_CONTENT_TYPE);
        tags.created_ms = self.clock.now_ms();
        tags.content_size = bytes.len() as u64;

        match self.store.put(bytes, tags).await {
            Ok(receipt) => {
                let mut guard = slot.warm.write().await;
                if let Some(warm) = guard.as_mut() {
                    // Adds racing the blob write stay dirty for the next
                    // snapshot.
                    warm.dirty = warm.dirty.saturating_sub(captured_dirty);
                    warm.snapshot_ref = Some(receipt.address.clone());
                }
                self.counters.lock().0 += 1;
                info!(user = %user, address = %receipt.address, "index snapshot written");
                Ok(Some(receipt.address))
            }
            Err(e) => {
                self.counters.lock().1 += 1;
                warn!(user = %user, error = %e, "index snapshot failed; will retry");
                Err(e)
            }
        }
    }

    /// Apply the snapshot and eviction policy to every warm index:
    /// snapshot when `dirty >= snapshot_threshold` or the index has been
    /// add-idle with dirty state; evict warm indices unused for longer than
    /// the idle-eviction window.
    pub async fn maintain(&self) {
        let users: Vec<UserAddress> = self.slots.lock().keys().cloned().collect();
        for user in users {
            let slot = self.slot(&user);
            let (wants_flush, wants_evict) = {
                let guard = slot.warm.read().await;
                match guard.as_ref() {
                    None => (false, false),
                    Some(warm) => {
                        let flush = warm.dirty >= self.config.snapshot_threshold
                            || (warm.dirty > 0
                                && warm.last_add.elapsed() >= self.config.snapshot_idle);
                        let evict = warm.last_used.elapsed() >= self.config.idle_eviction;
                        (flush, evict)
                    }
                }
            };

            if wants_flush || wants_evict {
                // Eviction of a dirty index snapshots first so nothing is
                // lost; a failed snapshot cancels the eviction.
                if let Err(e) = self.flush(&user).await {
                    warn!(user = %user, error = %e, "maintenance flush failed");
                    continue;
                }
            }
            if wants_evict {
                let mut guard = slot.warm.write().await;
                let clean = guard.as_ref().is_some_and(|warm| warm.dirty == 0);
                if clean {
                    info!(user = %user, "evicting idle warm index");
                    *guard = None;
                }
            }
        }
    }

    /// Stats snapshot across users.
    pub async fn stats(&self) -> IndexManagerStats {
        let slots: Vec<(UserAddress, Arc<UserSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(u, s)| (u.clone(), Arc::clone(s)))
            .collect();

        let mut users = Vec::with_capacity(slots.len());
        for (user, slot) in slots {
            let guard = slot.warm.read().await;
            match guard.as_ref() {
                Some(warm) => users.push(UserIndexStats {
                    user,
                    warm: true,
                    size: warm.index.len(),
                    pending_snapshot: warm.dirty,
                    snapshot_ref: warm.snapshot_ref.clone(),
                }),
                None => users.push(UserIndexStats {
                    user,
                    warm: false,
                    size: 0,
                    pending_snapshot: 0,
                    snapshot_ref: None,
                }),
            }
        }
        let (snapshots_written, snapshot_failures) = *self.counters.lock();
        IndexManagerStats {
            users,
            snapshots_written,
            snapshot_failures,
        }
    }

    /// Most recent snapshot blob for a user, by `created_ms` tag.
    async fn latest_snapshot(&self, user: &UserAddress) -> Result<Option<BlobAddress>> {
        let mut best: Option<(i64, BlobAddress)> = None;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .list(
                    user.as_str(),
                    Some(("content_type", SNAPSHOT_CONTENT_TYPE)),
                    64,
                    cursor.as_deref(),
                )
                .await?;
            for address in page.addresses {
                if let Some(tags) = self.store.head(&address).await? {
                    if best.as_ref().map_or(true, |(ms, _)| tags.created_ms > *ms) {
                        best = Some((tags.created_ms, address));
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(best.map(|(_, address)| address))
    }
}

/// Stable level-sampling seed per user.
fn seed_for(user: &UserAddress) -> u64 {
    crate::embeddings::content_key(user.as_str(), "hnsw-level-seed")
}
