//! Ingestion pipeline.
//!
//! classify → embed → encrypt → store → index → graph, with at-most-once
//! dedup per user and the partial-failure ladder: encryption and blob
//! faults abort with no side effects; vector-enqueue faults defer to the
//! needs-reindex list; graph faults defer to the pending-graph list. Within
//! one user, accepted results appear in wall-clock acceptance order.

mod dedup;

pub use dedup::DedupTable;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::batcher::{BatchItem, BatchProcessor, Batcher};
use crate::blob::{content_hash_hex, BlobStore, BlobTags};
use crate::cache::ContentCache;
use crate::classifier::Classifier;
use crate::clock::SharedClock;
use crate::embeddings::EmbeddingService;
use crate::envelope::SealEnvelope;
use crate::error::{Error, Result};
use crate::events::{EventBus, WalletEvent};
use crate::graph::{GraphExtractor, GraphManager};
use crate::identity::IbeIdentity;
use crate::index::{VecAdd, VectorIndexManager};
use crate::records::RecordStore;
use crate::types::{
    EncryptionDescriptor, IngestOutcome, MemoryId, MemoryRecord, SkipReason, UserAddress,
};

/// Batch kind for embedding jobs.
pub const EMBED_KIND: &str = "embed";

/// Batch kind for one user's vector adds.
#[must_use]
pub fn vec_add_kind(user: &UserAddress) -> String {
    format!("vec-add:{user}")
}

/// Host-facing ingest options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Overrides the classifier confidence as the stored importance.
    pub importance: Option<f32>,
    /// Seals under this identity instead of `self(user)`.
    pub identity: Option<IbeIdentity>,
    pub tags: BTreeSet<String>,
}

/// One embedding request travelling through the embed batch kind.
pub struct EmbedJob {
    pub text: String,
    reply: oneshot::Sender<std::result::Result<Arc<Vec<f32>>, String>>,
}

/// Processor for [`EMBED_KIND`]: one provider batch call per cut batch.
pub struct EmbedBatchProcessor {
    service: Arc<EmbeddingService>,
}

impl EmbedBatchProcessor {
    #[must_use]
    pub fn new(service: Arc<EmbeddingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl BatchProcessor<EmbedJob> for EmbedBatchProcessor {
    async fn process(&self, _kind: &str, items: Vec<BatchItem<EmbedJob>>) -> anyhow::Result<()> {
        let texts: Vec<String> = items.iter().map(|item| item.payload.text.clone()).collect();
        match self.service.embed_batch(&texts).await {
            Ok(vectors) => {
                for (item, vector) in items.into_iter().zip(vectors) {
                    let _ = item.payload.reply.send(Ok(vector));
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                for item in items {
                    let _ = item.payload.reply.send(Err(message.clone()));
                }
                Err(anyhow::anyhow!(message))
            }
        }
    }
}

/// Processor for `vec-add:<user>` kinds: inserts into the warm index.
pub struct VecAddProcessor {
    index: Arc<VectorIndexManager>,
}

impl VecAddProcessor {
    #[must_use]
    pub fn new(index: Arc<VectorIndexManager>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl BatchProcessor<VecAdd> for VecAddProcessor {
    async fn process(&self, _kind: &str, items: Vec<BatchItem<VecAdd>>) -> anyhow::Result<()> {
        // A kind carries a single user, but group defensively anyway.
        let mut by_user: HashMap<UserAddress, Vec<VecAdd>> = HashMap::new();
        for item in items {
            by_user
                .entry(item.payload.user.clone())
                .or_default()
                .push(item.payload);
        }
        for (user, adds) in by_user {
            self.index.add_batch(&user, adds).await?;
        }
        Ok(())
    }
}

/// A vector add deferred after an enqueue failure.
struct ReindexEntry {
    memory_id: MemoryId,
    vector_ref: u64,
    embedding: Arc<Vec<f32>>,
}

/// Pipeline counters for the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub accepted: u64,
    pub skipped_low_value: u64,
    pub skipped_duplicate: u64,
    pub skipped_classifier_error: u64,
    pub needs_reindex: usize,
    pub pending_graph: usize,
    pub dedup_tracked: usize,
}

/// The ingestion pipeline.
pub struct IngestPipeline {
    classifier: Arc<Classifier>,
    embeddings: Arc<EmbeddingService>,
    embed_batcher: Arc<Batcher<EmbedJob>>,
    index_batcher: Arc<Batcher<VecAdd>>,
    index: Arc<VectorIndexManager>,
    envelope: Arc<SealEnvelope>,
    blob_store: Arc<dyn BlobStore>,
    cache: Arc<ContentCache>,
    graph: Arc<GraphManager>,
    extractor: Arc<GraphExtractor>,
    records: Arc<dyn RecordStore>,
    dedup: DedupTable,
    events: EventBus,
    clock: SharedClock,
    user_locks: Mutex<HashMap<UserAddress, Arc<tokio::sync::Mutex<()>>>>,
    vector_counters: Mutex<HashMap<UserAddress, u64>>,
    needs_reindex: Mutex<HashMap<UserAddress, Vec<ReindexEntry>>>,
    pending_graph: Mutex<HashMap<UserAddress, Vec<(MemoryId, String)>>>,
    registered_kinds: Mutex<HashSet<String>>,
    counters: Mutex<(u64, u64, u64, u64)>,
}

#[allow(clippy::too_many_arguments)]
impl IngestPipeline {
    #[must_use]
    pub fn new(
        classifier: Arc<Classifier>,
        embeddings: Arc<EmbeddingService>,
        embed_batcher: Arc<Batcher<EmbedJob>>,
        index_batcher: Arc<Batcher<VecAdd>>,
        index: Arc<VectorIndexManager>,
        envelope: Arc<SealEnvelope>,
        blob_store: Arc<dyn BlobStore>,
        cache: Arc<ContentCache>,
        graph: Arc<GraphManager>,
        extractor: Arc<GraphExtractor>,
        records: Arc<dyn RecordStore>,
        dedup: DedupTable,
        events: EventBus,
        clock: SharedClock,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            classifier,
            embeddings: Arc::clone(&embeddings),
            embed_batcher,
            index_batcher,
            index,
            envelope,
            blob_store,
            cache,
            graph,
            extractor,
            records,
            dedup,
            events,
            clock,
            user_locks: Mutex::new(HashMap::new()),
            vector_counters: Mutex::new(HashMap::new()),
            needs_reindex: Mutex::new(HashMap::new()),
            pending_graph: Mutex::new(HashMap::new()),
            registered_kinds: Mutex::new(HashSet::new()),
            counters: Mutex::new((0, 0, 0, 0)),
        });
        pipeline
            .embed_batcher
            .register_kind(EMBED_KIND, Arc::new(EmbedBatchProcessor::new(embeddings)));
        pipeline
    }

    /// Ingest one utterance for a user.
    #[instrument(skip(self, utterance, options), fields(user = %user))]
    pub async fn ingest(
        &self,
        user: &UserAddress,
        utterance: &str,
        options: IngestOptions,
    ) -> Result<IngestOutcome> {
        if utterance.trim().is_empty() {
            return Err(Error::InvalidInput("empty utterance".into()));
        }

        // Acceptance order within a user is wall-clock order.
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        // Step 1: classify. Transport faults degrade to a skip with their
        // own reason; the memory plane stays available.
        let classification = match self.classifier.classify(utterance).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "classifier unavailable; skipping utterance");
                self.counters.lock().3 += 1;
                return Ok(IngestOutcome::Skipped {
                    reason: SkipReason::ClassifierError,
                    existing_memory_id: None,
                });
            }
        };
        if !classification.should_save {
            self.counters.lock().1 += 1;
            return Ok(IngestOutcome::Skipped {
                reason: SkipReason::LowValue,
                existing_memory_id: None,
            });
        }

        // Step 2: at-most-once within the dedup window.
        let content_hash = content_hash_hex(utterance.as_bytes());
        if let Some(existing) = self.dedup.probe(user, &content_hash) {
            self.counters.lock().2 += 1;
            return Ok(IngestOutcome::Skipped {
                reason: SkipReason::Duplicate,
                existing_memory_id: Some(existing),
            });
        }

        // Step 3: embed (memo hot path, batched miss path).
        let embedding = self.embed(utterance).await?;

        // Step 4: encrypt. Any fault aborts with no side effects.
        let identity = options
            .identity
            .clone()
            .unwrap_or_else(|| IbeIdentity::owner(user.clone()));
        let sealed = self.envelope.encrypt(utterance.as_bytes(), &identity).await?;

        // Step 5: store ciphertext. Abort on fault; nothing to roll back.
        let importance = options
            .importance
            .unwrap_or(classification.confidence)
            .clamp(0.0, 1.0);
        let now = self.clock.now_ms();
        let tags = BlobTags {
            owner: user.as_str().to_string(),
            category: classification.category.as_str().to_string(),
            topic: None,
            importance,
            content_type: "text/plain+sealed".to_string(),
            content_size: sealed.bytes.len() as u64,
            content_hash: content_hash_hex(&sealed.bytes),
            created_ms: now,
            is_encrypted: true,
            encryption_type: "ibe".to_string(),
            extra: std::collections::BTreeMap::new(),
        };
        let ciphertext = sealed.bytes.clone();
        let receipt = self.blob_store.put(sealed.bytes, tags).await?;
        self.cache
            .insert(receipt.address.clone(), Arc::new(ciphertext));

        // Step 6: assign the per-user vector id.
        let memory_id = MemoryId::generate();
        let vector_ref = self.next_vector_ref(user).await?;

        // Step 7: enqueue the vector add; a failure defers to reindex.
        let vector_ref = match self
            .enqueue_vector(user, vector_ref, Arc::clone(&embedding), memory_id)
            .await
        {
            Ok(()) => Some(vector_ref),
            Err(e) => {
                warn!(error = %e, "vector enqueue failed; deferring to reindex");
                self.needs_reindex
                    .lock()
                    .entry(user.clone())
                    .or_default()
                    .push(ReindexEntry {
                        memory_id,
                        vector_ref,
                        embedding: Arc::clone(&embedding),
                    });
                None
            }
        };

        // Step 8: graph extraction; failures defer, the memory still lands.
        let graph_refs = match self.extract_into_graph(user, utterance).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                debug!(error = %e, "graph extraction deferred");
                self.pending_graph
                    .lock()
                    .entry(user.clone())
                    .or_default()
                    .push((memory_id, utterance.to_string()));
                BTreeSet::new()
            }
        };

        // Step 9: persist the record and announce.
        let record = MemoryRecord {
            memory_id,
            owner: user.clone(),
            category: classification.category,
            created_at: now,
            updated_at: now,
            importance,
            tags: options.tags,
            content_ref: receipt.address.clone(),
            vector_ref,
            embedding_model: self.embeddings.model_id(),
            encryption: EncryptionDescriptor::Ibe {
                identity: sealed.identity,
                aad_hash: sealed.aad_hash,
            },
            graph_refs,
        };
        self.records.upsert(record).await?;
        self.dedup.record(user, content_hash, memory_id);
        self.counters.lock().0 += 1;
        self.events.emit(WalletEvent::MemoryCreated {
            user: user.clone(),
            memory_id,
        });
        info!(memory_id = %memory_id, "memory ingested");

        Ok(IngestOutcome::Accepted {
            memory_id,
            vector_ref,
            content_ref: receipt.address,
        })
    }

    /// Embed through the memo cache, batching misses through [`EMBED_KIND`].
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(vector) = self.embeddings.probe(text) {
            return Ok(vector);
        }
        let (reply, receiver) = oneshot::channel();
        self.embed_batcher
            .enqueue(
                EMBED_KIND,
                EmbedJob {
                    text: text.to_string(),
                    reply,
                },
                0,
            )
            .await?;
        match receiver.await {
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(message)) => Err(Error::EmbeddingUnavailable(message)),
            Err(_) => Err(Error::EmbeddingUnavailable(
                "embedding batch was dropped".into(),
            )),
        }
    }

    /// Retry deferred vector adds and graph extractions for a user.
    /// Invoked from idle flush and the host-facing `flush`.
    pub async fn retry_deferred(&self, user: &UserAddress) -> Result<()> {
        let reindex: Vec<ReindexEntry> = self
            .needs_reindex
            .lock()
            .get_mut(user)
            .map(std::mem::take)
            .unwrap_or_default();
        for entry in reindex {
            match self
                .enqueue_vector(user, entry.vector_ref, Arc::clone(&entry.embedding), entry.memory_id)
                .await
            {
                Ok(()) => {
                    if let Some(mut record) = self.records.get(user, entry.memory_id).await? {
                        record.vector_ref = Some(entry.vector_ref);
                        record.updated_at = self.clock.now_ms();
                        self.records.upsert(record).await?;
                    }
                }
                Err(e) => {
                    warn!(error = %e, memory_id = %entry.memory_id, "reindex retry failed");
                    self.needs_reindex
                        .lock()
                        .entry(user.clone())
                        .or_default()
                        .push(entry);
                }
            }
        }

        let pending: Vec<(MemoryId, String)> = self
            .pending_graph
            .lock()
            .get_mut(user)
            .map(std::mem::take)
            .unwrap_or_default();
        for (memory_id, text) in pending {
            match self.extract_into_graph(user, &text).await {
                Ok(ids) => {
                    if let Some(mut record) = self.records.get(user, memory_id).await? {
                        record.graph_refs.extend(ids);
                        record.updated_at = self.clock.now_ms();
                        self.records.upsert(record).await?;
                    }
                }
                Err(e) => {
                    debug!(error = %e, memory_id = %memory_id, "graph retry failed");
                    self.pending_graph
                        .lock()
                        .entry(user.clone())
                        .or_default()
                        .push((memory_id, text));
                }
            }
        }
        Ok(())
    }

    /// Retry deferred work for every user that has any.
    pub async fn retry_all_deferred(&self) {
        let mut users: HashSet<UserAddress> = HashSet::new();
        users.extend(self.needs_reindex.lock().keys().cloned());
        users.extend(self.pending_graph.lock().keys().cloned());
        for user in users {
            if let Err(e) = self.retry_deferred(&user).await {
                warn!(user = %user, error = %e, "deferred retry failed");
            }
        }
    }

    /// Replay missing vector entries from the record table (restart
    /// recovery): any record with a `vector_ref` absent from the warm index
    /// is re-embedded from its decrypted content and re-added.
    pub async fn reindex_missing(&self, user: &UserAddress) -> Result<usize> {
        let records = self.records.list_owner(user).await?;
        let mut replayed = 0;
        for record in records {
            let Some(vector_ref) = record.vector_ref else {
                continue;
            };
            if self.index.contains(user, vector_ref).await? {
                continue;
            }
            let ciphertext = self.cache.get(&record.content_ref).await?;
            let requesting = IbeIdentity::owner(user.clone());
            let plaintext = self.envelope.decrypt(&ciphertext, &requesting).await?;
            let text = String::from_utf8_lossy(&plaintext).to_string();
            let embedding = self.embed(&text).await?;
            self.enqueue_vector(user, vector_ref, embedding, record.memory_id)
                .await?;
            replayed += 1;
        }
        if replayed > 0 {
            info!(user = %user, replayed, "replayed missing vector entries");
        }
        Ok(replayed)
    }

    /// Assign the next vector id for a user; used by the update path.
    pub async fn next_vector_ref_for(&self, user: &UserAddress) -> Result<u64> {
        self.next_vector_ref(user).await
    }

    /// Enqueue a vector add on the user's batch kind; used by the update
    /// path.
    pub async fn enqueue_vector_for(
        &self,
        user: &UserAddress,
        vector_ref: u64,
        embedding: Arc<Vec<f32>>,
        memory_id: MemoryId,
    ) -> Result<()> {
        self.enqueue_vector(user, vector_ref, embedding, memory_id)
            .await
    }

    /// Per-user next vector id, seeded from the record table so ids stay
    /// unique across restarts.
    async fn next_vector_ref(&self, user: &UserAddress) -> Result<u64> {
        let seeded = self.vector_counters.lock().get(user).copied();
        let next = match seeded {
            Some(current) => current,
            None => {
                let records = self.records.list_owner(user).await?;
                records
                    .iter()
                    .filter_map(|r| r.vector_ref)
                    .max()
                    .map_or(0, |max| max + 1)
            }
        };
        self.vector_counters.lock().insert(user.clone(), next + 1);
        Ok(next)
    }

    async fn enqueue_vector(
        &self,
        user: &UserAddress,
        vector_ref: u64,
        embedding: Arc<Vec<f32>>,
        memory_id: MemoryId,
    ) -> Result<()> {
        let kind = self.ensure_vec_kind(user);
        self.index_batcher
            .enqueue(
                &kind,
                VecAdd {
                    user: user.clone(),
                    vector_id: vector_ref,
                    vector: embedding,
                    memory_id,
                },
                0,
            )
            .await?;
        Ok(())
    }

    async fn extract_into_graph(&self, user: &UserAddress, text: &str) -> Result<Vec<u64>> {
        let extraction = self.extractor.extract(text).await?;
        self.graph.add(user, &extraction).await
    }

    fn ensure_vec_kind(&self, user: &UserAddress) -> String {
        let kind = vec_add_kind(user);
        let mut registered = self.registered_kinds.lock();
        if registered.insert(kind.clone()) {
            self.index_batcher
                .register_kind(&kind, Arc::new(VecAddProcessor::new(Arc::clone(&self.index))));
        }
        kind
    }

    fn user_lock(&self, user: &UserAddress) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.user_locks.lock();
        Arc::clone(locks.entry(user.clone()).or_default())
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let (accepted, skipped_low_value, skipped_duplicate, skipped_classifier_error) =
            *self.counters.lock();
        PipelineStats {
            accepted,
            skipped_low_value,
            skipped_duplicate,
            skipped_classifier_error,
            needs_reindex: self.needs_reindex.lock().values().map(Vec::len).sum(),
            pending_graph: self.pending_graph.lock().values().map(Vec::len).sum(),
            dedup_tracked: self.dedup.tracked(),
        }
    }
}
