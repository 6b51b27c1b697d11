//! The memory wallet: owner-coordinator for all per-user components.
//!
//! Components reference the wallet's shared handles rather than each other,
//! so there is no mutual ownership between the pipeline, the indices and
//! the retrieval engine. Hosts wire external collaborators (blob store,
//! LLM, key servers, signer) through [`MemoryWalletBuilder`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::batcher::{Batcher, BatcherConfig, KindStats};
use crate::blob::{BlobStore, BlobTags, RetryingBlobStore};
use crate::cache::{CacheMetrics, ContentCache};
use crate::classifier::Classifier;
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::embeddings::{EmbeddingProvider, EmbeddingService, EmbeddingServiceStats};
use crate::envelope::{ChallengeSigner, EnvelopeStats, KeyServer, SealEnvelope, ServerHandle};
use crate::error::{Error, Result};
use crate::events::{EventBus, WalletEvent};
use crate::graph::{GraphExtractor, GraphManager, GraphManagerStats};
use crate::identity::IbeIdentity;
use crate::index::{IndexManagerStats, VecAdd, VectorIndexManager};
use crate::permission::{ConsentGrant, PermissionPredicate, Scope};
use crate::pipeline::{EmbedJob, IngestOptions, IngestPipeline, PipelineStats};
use crate::records::{require_record, InMemoryRecordStore, RecordStore};
use crate::retrieval::{RetrievalEngine, SearchOptions, SearchResponse};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::{
    IngestOutcome, KeyServerConfig, MemoryId, MemoryRecord, MemvaultConfig, UserAddress,
};

/// How often the maintenance loop applies snapshot/eviction policy.
const MAINTENANCE_TICK: Duration = Duration::from_millis(500);

/// Aggregated stats surface.
#[derive(Debug, Clone, Default)]
pub struct WalletStats {
    pub cache: CacheMetrics,
    pub embeddings: EmbeddingServiceStats,
    pub envelope: EnvelopeStats,
    pub index: IndexManagerStats,
    pub graph: GraphManagerStats,
    pub pipeline: PipelineStats,
    pub embed_batcher: std::collections::HashMap<String, KindStats>,
    pub index_batcher: std::collections::HashMap<String, KindStats>,
    pub permission_cached: usize,
    pub records: usize,
}

/// Builder for [`MemoryWallet`].
pub struct MemoryWalletBuilder {
    config: MemvaultConfig,
    blob_store: Option<Arc<dyn BlobStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    llm: Option<Arc<dyn crate::llm::LlmProvider>>,
    signer: Option<Arc<dyn ChallengeSigner>>,
    key_servers: Vec<(KeyServerConfig, Arc<dyn KeyServer>)>,
    records: Option<Arc<dyn RecordStore>>,
    clock: Option<SharedClock>,
}

impl MemoryWalletBuilder {
    #[must_use]
    pub fn new(config: MemvaultConfig) -> Self {
        Self {
            config,
            blob_store: None,
            embedder: None,
            llm: None,
            signer: None,
            key_servers: Vec::new(),
            records: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn crate::llm::LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn signer(mut self, signer: Arc<dyn ChallengeSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Add one key-share holder with its transport.
    #[must_use]
    pub fn key_server(mut self, config: KeyServerConfig, transport: Arc<dyn KeyServer>) -> Self {
        self.key_servers.push((config, transport));
        self
    }

    #[must_use]
    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Wire everything together.
    pub fn build(self) -> Result<MemoryWallet> {
        let config = self.config;
        let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let raw_store = self
            .blob_store
            .ok_or_else(|| Error::Configuration("blob store is required".into()))?;
        let llm = self
            .llm
            .ok_or_else(|| Error::Configuration("LLM provider is required".into()))?;
        let signer = self
            .signer
            .ok_or_else(|| Error::Configuration("challenge signer is required".into()))?;
        if self.key_servers.is_empty() {
            return Err(Error::Configuration("at least one key server is required".into()));
        }

        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(crate::embeddings::HashEmbedder::default_model()));
        let records: Arc<dyn RecordStore> = self
            .records
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));

        let blob_store: Arc<dyn BlobStore> = Arc::new(RetryingBlobStore::new(
            raw_store,
            RetryPolicy::with_config(
                RetryConfig::default().with_total_budget(config.timeouts.blob),
            ),
        ));

        let cache = Arc::new(ContentCache::new(
            Arc::clone(&blob_store),
            config.cache.clone(),
        ));

        let servers = self
            .key_servers
            .into_iter()
            .map(|(server_config, transport)| ServerHandle {
                config: server_config,
                transport,
            })
            .collect();
        let envelope = Arc::new(SealEnvelope::new(
            &config.seal,
            servers,
            signer,
            Arc::clone(&clock),
            config.timeouts.key_server,
        )?);

        let embeddings = Arc::new(EmbeddingService::new(
            embedder,
            &config.embedding,
            config.timeouts.embed,
        ));

        let index = Arc::new(VectorIndexManager::new(
            Arc::clone(&blob_store),
            Arc::clone(&clock),
            config.index.clone(),
            embeddings.dimension(),
        ));

        let graph = Arc::new(GraphManager::new(
            Arc::clone(&blob_store),
            Arc::clone(&clock),
            config.pipeline.graph_checkpoint_every,
            config.index.snapshot_idle,
            crate::constants::DEFAULT_GRAPH_VISIT_BUDGET,
        ));

        let classifier = Arc::new(Classifier::new(Arc::clone(&llm), config.timeouts.llm));
        let extractor = Arc::new(GraphExtractor::new(llm, config.timeouts.llm));

        let embed_batcher: Arc<Batcher<EmbedJob>> = Arc::new(Batcher::new(BatcherConfig {
            max_batch_size: config.embedding.batch_size,
            max_batch_age: config.embedding.batch_age,
            max_pending: config.pipeline.max_pending,
            enqueue_timeout: config.pipeline.enqueue_timeout,
        }));
        let index_batcher: Arc<Batcher<VecAdd>> = Arc::new(Batcher::new(BatcherConfig {
            max_batch_size: config.index.batch_size,
            max_batch_age: config.index.batch_age,
            max_pending: config.pipeline.max_pending,
            enqueue_timeout: config.pipeline.enqueue_timeout,
        }));

        let permission = Arc::new(PermissionPredicate::new(Arc::clone(&clock)));
        let events = EventBus::default();

        let pipeline = IngestPipeline::new(
            classifier,
            Arc::clone(&embeddings),
            Arc::clone(&embed_batcher),
            Arc::clone(&index_batcher),
            Arc::clone(&index),
            Arc::clone(&envelope),
            Arc::clone(&blob_store),
            Arc::clone(&cache),
            Arc::clone(&graph),
            extractor,
            Arc::clone(&records),
            crate::pipeline::DedupTable::new(Arc::clone(&clock), config.pipeline.dedup_window),
            events.clone(),
            Arc::clone(&clock),
        );

        let retrieval = RetrievalEngine::new(
            Arc::clone(&embeddings),
            Arc::clone(&index),
            Arc::clone(&graph),
            Arc::clone(&records),
            Arc::clone(&cache),
            Arc::clone(&envelope),
            Arc::clone(&permission),
            config.retrieval.clone(),
        );

        let wallet = MemoryWallet {
            clock,
            blob_store,
            cache,
            envelope,
            embeddings,
            index,
            graph,
            permission,
            records,
            pipeline,
            retrieval: Arc::new(retrieval),
            embed_batcher,
            index_batcher,
            events,
            tasks: Mutex::new(Vec::new()),
        };
        wallet.spawn_background();
        Ok(wallet)
    }
}

/// The memory plane facade.
pub struct MemoryWallet {
    clock: SharedClock,
    blob_store: Arc<dyn BlobStore>,
    cache: Arc<ContentCache>,
    envelope: Arc<SealEnvelope>,
    embeddings: Arc<EmbeddingService>,
    index: Arc<VectorIndexManager>,
    graph: Arc<GraphManager>,
    permission: Arc<PermissionPredicate>,
    records: Arc<dyn RecordStore>,
    pipeline: Arc<IngestPipeline>,
    retrieval: Arc<RetrievalEngine>,
    embed_batcher: Arc<Batcher<EmbedJob>>,
    index_batcher: Arc<Batcher<VecAdd>>,
    events: EventBus,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryWallet {
    /// Builder entry point.
    #[must_use]
    pub fn builder(config: MemvaultConfig) -> MemoryWalletBuilder {
        MemoryWalletBuilder::new(config)
    }

    /// Ingest one utterance.
    pub async fn ingest(
        &self,
        user: &UserAddress,
        utterance: &str,
        options: Option<IngestOptions>,
    ) -> Result<IngestOutcome> {
        self.pipeline
            .ingest(user, utterance, options.unwrap_or_default())
            .await
    }

    /// Search the user's memories.
    pub async fn search(
        &self,
        user: &UserAddress,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse> {
        self.retrieval.search(user, query, options).await
    }

    /// Fetch one memory record.
    pub async fn get_memory(&self, user: &UserAddress, memory_id: MemoryId) -> Result<MemoryRecord> {
        require_record(self.records.as_ref(), user, memory_id).await
    }

    /// All memory records for a user (metadata only).
    pub async fn list_memories(&self, user: &UserAddress) -> Result<Vec<MemoryRecord>> {
        self.records.list_owner(user).await
    }

    /// Replace a memory's content: new blob, refreshed vector entry, a
    /// version link appended to its graph refs; the memory id is stable.
    #[instrument(skip(self, new_text), fields(user = %user, memory_id = %memory_id))]
    pub async fn update(
        &self,
        user: &UserAddress,
        memory_id: MemoryId,
        new_text: &str,
    ) -> Result<MemoryRecord> {
        if new_text.trim().is_empty() {
            return Err(Error::InvalidInput("empty replacement text".into()));
        }
        let mut record = require_record(self.records.as_ref(), user, memory_id).await?;

        let identity = crate::retrieval::record_identity(&record)
            .unwrap_or_else(|| IbeIdentity::owner(user.clone()));
        let sealed = self.envelope.encrypt(new_text.as_bytes(), &identity).await?;

        let now = self.clock.now_ms();
        let tags = BlobTags {
            owner: user.as_str().to_string(),
            category: record.category.as_str().to_string(),
            topic: None,
            importance: record.importance,
            content_type: "text/plain+sealed".to_string(),
            content_size: sealed.bytes.len() as u64,
            content_hash: crate::blob::content_hash_hex(&sealed.bytes),
            created_ms: now,
            is_encrypted: true,
            encryption_type: "ibe".to_string(),
            extra: std::collections::BTreeMap::new(),
        };
        let ciphertext = sealed.bytes.clone();
        let receipt = self.blob_store.put(sealed.bytes, tags).await?;
        self.cache
            .insert(receipt.address.clone(), Arc::new(ciphertext));

        // Version link: the previous content stays reachable through the
        // graph until its blob's retention epoch lapses.
        let version_node = self
            .graph
            .upsert_node(
                user,
                "version",
                &format!("{memory_id}@{}", record.updated_at),
                [("content_ref".to_string(), record.content_ref.to_string())]
                    .into_iter()
                    .collect(),
            )
            .await?;

        // Refresh the vector entry under a new id.
        if let Some(old_ref) = record.vector_ref {
            let _ = self.index.remove(user, old_ref).await;
        }
        let embedding = self.pipeline.embed(new_text).await?;
        let new_vector_ref = self.pipeline.next_vector_ref_for(user).await?;
        self.pipeline
            .enqueue_vector_for(user, new_vector_ref, embedding, memory_id)
            .await?;

        record.content_ref = receipt.address;
        record.encryption = crate::types::EncryptionDescriptor::Ibe {
            identity: sealed.identity,
            aad_hash: sealed.aad_hash,
        };
        record.vector_ref = Some(new_vector_ref);
        record.updated_at = now;
        record.graph_refs.insert(version_node);
        self.records.upsert(record.clone()).await?;

        self.events.emit(WalletEvent::MemoryUpdated {
            user: user.clone(),
            memory_id,
        });
        Ok(record)
    }

    /// Remove a memory: record row, vector entry, and (best effort) the
    /// content blob. Graph entities remain; they are shared across
    /// memories.
    #[instrument(skip(self), fields(user = %user, memory_id = %memory_id))]
    pub async fn delete(&self, user: &UserAddress, memory_id: MemoryId) -> Result<bool> {
        let Some(record) = self.records.get(user, memory_id).await? else {
            return Ok(false);
        };
        if let Some(vector_ref) = record.vector_ref {
            let _ = self.index.remove(user, vector_ref).await;
        }
        if let Err(e) = self.blob_store.delete(&record.content_ref).await {
            warn!(error = %e, "blob delete deferred to retention epoch");
        }
        let removed = self.records.delete(user, memory_id).await?;
        if removed {
            self.events.emit(WalletEvent::MemoryDeleted {
                user: user.clone(),
                memory_id,
            });
        }
        Ok(removed)
    }

    /// Grant an app access to this user's memories at the given scopes.
    pub fn grant(
        &self,
        user: &UserAddress,
        app: &UserAddress,
        scopes: &[Scope],
        expires_at: Option<i64>,
    ) {
        let now = self.clock.now_ms();
        for scope in scopes {
            self.permission.grant(ConsentGrant {
                requesting: app.clone(),
                target: user.clone(),
                scope: *scope,
                granted_at: now,
                expires_at,
            });
        }
        info!(user = %user, app = %app, scopes = scopes.len(), "consent granted");
    }

    /// Revoke one grant.
    pub fn revoke(&self, user: &UserAddress, app: &UserAddress, scope: Scope) -> bool {
        self.permission.revoke(app, user, scope)
    }

    /// Rotate the user's backup key: evicts the session, bumps the key
    /// version and invalidates cached permission decisions.
    pub fn rotate_keys(&self, user: &UserAddress, ttl_min: Option<u64>) -> u32 {
        let version = self.envelope.rotate(user, ttl_min);
        self.permission.invalidate_user(user);
        self.events.emit(WalletEvent::KeysRotated {
            user: user.clone(),
            version,
        });
        version
    }

    /// Drain the user's batched work and write an index snapshot. When this
    /// returns, every prior accepted `ingest` is searchable.
    pub async fn flush(&self, user: &UserAddress) -> Result<()> {
        let _ = self.embed_batcher.flush_kind(crate::pipeline::EMBED_KIND).await;
        let kind = crate::pipeline::vec_add_kind(user);
        let _ = self.index_batcher.flush_kind(&kind).await;
        self.pipeline.retry_deferred(user).await?;
        let _ = self.index_batcher.flush_kind(&kind).await;
        self.index.flush(user).await?;
        Ok(())
    }

    /// Durably checkpoint the user's knowledge graph.
    pub async fn checkpoint(&self, user: &UserAddress) -> Result<()> {
        self.graph.checkpoint(user).await?;
        Ok(())
    }

    /// Restart recovery: reload the snapshot and replay records whose
    /// vectors are missing from it, then flush.
    pub async fn recover(&self, user: &UserAddress) -> Result<usize> {
        let replayed = self.pipeline.reindex_missing(user).await?;
        self.flush(user).await?;
        Ok(replayed)
    }

    /// Subscribe to wallet events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Aggregate stats snapshot.
    pub async fn stats(&self) -> WalletStats {
        WalletStats {
            cache: self.cache.metrics(),
            embeddings: self.embeddings.stats(),
            envelope: self.envelope.stats(),
            index: self.index.stats().await,
            graph: self.graph.stats().await,
            pipeline: self.pipeline.stats(),
            embed_batcher: self.embed_batcher.stats(),
            index_batcher: self.index_batcher.stats(),
            permission_cached: self.permission.cached_decisions(),
            records: self.records.count().await.unwrap_or(0),
        }
    }

    /// Flush all pending work and stop background tasks.
    pub async fn shutdown(&self) {
        self.embed_batcher.shutdown().await;
        self.index_batcher.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_background(&self) {
        // Policy loop: snapshots, eviction, deferred retries.
        let index = Arc::clone(&self.index);
        let graph = Arc::clone(&self.graph);
        let pipeline = Arc::clone(&self.pipeline);
        let maintenance = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                index.maintain().await;
                graph.maintain().await;
                pipeline.retry_all_deferred().await;
            }
        });

        // Forward batch-item failures onto the wallet event bus.
        let mut embed_failures = self.embed_batcher.subscribe_failures();
        let mut index_failures = self.index_batcher.subscribe_failures();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let failed = tokio::select! {
                    failed = embed_failures.recv() => failed,
                    failed = index_failures.recv() => failed,
                };
                match failed {
                    Ok(failed) => events.emit(WalletEvent::BatchItemFailed {
                        kind: failed.kind,
                        item_id: failed.item_id,
                        error: failed.error,
                    }),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(maintenance);
        tasks.push(forwarder);
    }
}

impl Drop for MemoryWallet {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
