//! Hybrid retrieval engine.
//!
//! Runs the active search modes, merges per-mode scores, applies the
//! permission filter, optionally attaches decrypted content (annotating
//! per-result failures instead of failing the query), and computes facets
//! over the post-permission candidate set.

mod facets;
mod filters;

pub use facets::{compute_facets, Facets};
pub use filters::SearchFilters;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::cache::ContentCache;
use crate::embeddings::EmbeddingService;
use crate::envelope::SealEnvelope;
use crate::error::{Error, Result};
use crate::graph::GraphManager;
use crate::identity::IbeIdentity;
use crate::index::VectorIndexManager;
use crate::permission::{PermissionPredicate, Scope};
use crate::records::RecordStore;
use crate::types::{MemoryId, MemoryRecord, RetrievalConfig, UserAddress};

/// Search modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Keyword,
    Graph,
    Temporal,
    #[default]
    Hybrid,
}

/// Buckets for temporal aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Day,
    Week,
    Month,
}

/// Host-facing search options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    /// Result count; falls back to the configured default.
    pub k: Option<usize>,
    pub filters: SearchFilters,
    pub include_content: bool,
    pub include_facets: bool,
    /// Requesting identity; defaults to the owner.
    pub as_identity: Option<UserAddress>,
    /// Hop bound for graph expansion.
    pub graph_hops: usize,
    /// Temporal aggregation buckets.
    pub bucket: Option<TimeBucket>,
}

/// One scored result.
#[derive(Debug, Clone)]
pub struct SearchResultItem {
    pub memory_id: MemoryId,
    pub score: f32,
    /// Per-mode contributions, keyed by mode name.
    pub mode_scores: BTreeMap<&'static str, f32>,
    pub record: MemoryRecord,
    /// Decrypted content when `include_content` and decryption succeeded.
    pub content: Option<String>,
    pub is_encrypted: bool,
    pub decryption_failed: bool,
    /// Error kind name when decryption failed (e.g. `NoAccess`).
    pub failure_reason: Option<String>,
}

/// Per-query engine statistics.
#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    pub mode_timings_us: BTreeMap<&'static str, u64>,
    pub candidates: usize,
    pub permission_checked: usize,
    pub permission_passed: usize,
    pub decrypt_attempts: u64,
    pub decrypt_failures: u64,
}

impl SearchStats {
    #[must_use]
    pub fn permission_pass_rate(&self) -> f32 {
        if self.permission_checked == 0 {
            1.0
        } else {
            self.permission_passed as f32 / self.permission_checked as f32
        }
    }
}

/// Full search response.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub facets: Option<Facets>,
    /// Present for temporal queries with a bucket setting.
    pub buckets: Option<BTreeMap<String, usize>>,
    pub stats: SearchStats,
}

/// Lower-cased alphanumeric tokens of a query.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// The permission target used for a record sealed under `identity` when
/// `requesting` is not the owner: owner-sealed content is gated through the
/// cross-app identity path.
#[must_use]
pub fn effective_target(identity: &IbeIdentity, requesting: &UserAddress) -> IbeIdentity {
    match identity {
        IbeIdentity::Owner { user } if requesting != user => {
            IbeIdentity::app(user.clone(), requesting.clone())
        }
        other => other.clone(),
    }
}

/// The retrieval engine.
pub struct RetrievalEngine {
    embeddings: Arc<EmbeddingService>,
    index: Arc<VectorIndexManager>,
    graph: Arc<GraphManager>,
    records: Arc<dyn RecordStore>,
    cache: Arc<ContentCache>,
    envelope: Arc<SealEnvelope>,
    permission: Arc<PermissionPredicate>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        embeddings: Arc<EmbeddingService>,
        index: Arc<VectorIndexManager>,
        graph: Arc<GraphManager>,
        records: Arc<dyn RecordStore>,
        cache: Arc<ContentCache>,
        envelope: Arc<SealEnvelope>,
        permission: Arc<PermissionPredicate>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embeddings,
            index,
            graph,
            records,
            cache,
            envelope,
            permission,
            config,
        }
    }

    /// Run a search for `user`'s memories.
    #[instrument(skip(self, query, options), fields(user = %user, mode = ?options.mode))]
    pub async fn search(
        &self,
        user: &UserAddress,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse> {
        options.filters.validate()?;
        let k = options.k.unwrap_or(self.config.default_k);
        if k == 0 {
            return Err(Error::InvalidInput("k must be positive".into()));
        }
        let requesting = options.as_identity.clone().unwrap_or_else(|| user.clone());
        let graph_hops = if options.graph_hops == 0 { 2 } else { options.graph_hops };

        let mut stats = SearchStats::default();

        // Candidate records passing the faceted filters, with lookup maps.
        let all_records = self.records.list_owner(user).await?;
        let filtered: Vec<&MemoryRecord> = all_records
            .iter()
            .filter(|r| options.filters.matches(r))
            .collect();
        let by_vector: HashMap<u64, &MemoryRecord> = filtered
            .iter()
            .filter_map(|r| r.vector_ref.map(|v| (v, *r)))
            .collect();

        // Step 2: run the active modes.
        let mut mode_scores: HashMap<MemoryId, BTreeMap<&'static str, f32>> = HashMap::new();
        let mut record_score = |id: MemoryId, mode: &'static str, score: f32| {
            mode_scores.entry(id).or_default().insert(mode, score);
        };

        let run_vector = matches!(options.mode, SearchMode::Vector | SearchMode::Hybrid);
        let run_keyword = matches!(options.mode, SearchMode::Keyword | SearchMode::Hybrid);
        let run_graph = matches!(options.mode, SearchMode::Graph | SearchMode::Hybrid);
        let run_temporal = matches!(options.mode, SearchMode::Temporal | SearchMode::Hybrid);

        if run_vector {
            let started = Instant::now();
            let threshold = options
                .filters
                .similarity_threshold
                .unwrap_or(self.config.threshold);
            let fetch = (k * 3).max(k + 10);
            let embedding = self.embeddings.embed(query).await?;
            for hit in self.index.search(user, &embedding, fetch).await? {
                if hit.score < threshold {
                    continue;
                }
                if let Some(record) = by_vector.get(&hit.vector_id) {
                    record_score(record.memory_id, "vector", hit.score.clamp(0.0, 1.0));
                }
            }
            stats
                .mode_timings_us
                .insert("vector", started.elapsed().as_micros() as u64);
        }

        if run_keyword {
            let started = Instant::now();
            let terms = tokenize(query);
            if !terms.is_empty() {
                for record in &filtered {
                    let Some(text) = self.readable_content(record, &requesting).await else {
                        continue;
                    };
                    let haystack = text.to_lowercase();
                    if terms.iter().all(|term| haystack.contains(term)) {
                        record_score(record.memory_id, "keyword", 1.0);
                    }
                }
            }
            stats
                .mode_timings_us
                .insert("keyword", started.elapsed().as_micros() as u64);
        }

        if run_graph {
            let started = Instant::now();
            let mut seeds = Vec::new();
            for term in tokenize(query) {
                seeds.extend(self.graph.find_by_name(user, &term, None).await?);
            }
            if !seeds.is_empty() {
                let reached: HashSet<u64> = self
                    .graph
                    .neighbours(user, &seeds, graph_hops, None)
                    .await?;
                for record in &filtered {
                    let overlap = record
                        .graph_refs
                        .iter()
                        .filter(|id| reached.contains(id))
                        .count();
                    if overlap > 0 {
                        let score = overlap as f32 / (overlap as f32 + 1.0);
                        record_score(record.memory_id, "graph", score);
                    }
                }
            }
            stats
                .mode_timings_us
                .insert("graph", started.elapsed().as_micros() as u64);
        }

        let mut buckets: Option<BTreeMap<String, usize>> = None;
        if run_temporal {
            let started = Instant::now();
            let newest = filtered.iter().map(|r| r.created_at).max().unwrap_or(0);
            for record in &filtered {
                // Recency decay over days relative to the newest candidate.
                let age_days = (newest - record.created_at) as f32 / 86_400_000.0;
                let score = 1.0 / (1.0 + age_days);
                record_score(record.memory_id, "temporal", score);
            }
            if let Some(bucket) = options.bucket {
                buckets = Some(bucket_counts(&filtered, bucket));
            }
            stats
                .mode_timings_us
                .insert("temporal", started.elapsed().as_micros() as u64);
        }

        // Step 3: merge into one score per memory.
        let weights = self.mode_weights(options.mode);
        let by_id: HashMap<MemoryId, &MemoryRecord> =
            filtered.iter().map(|r| (r.memory_id, *r)).collect();
        let mut merged: Vec<(MemoryId, f32, BTreeMap<&'static str, f32>)> = mode_scores
            .into_iter()
            .filter(|(id, _)| by_id.contains_key(id))
            .map(|(id, scores)| {
                let total = scores
                    .iter()
                    .map(|(mode, score)| weights.get(mode).copied().unwrap_or(0.0) * score)
                    .sum::<f32>();
                (id, total, scores)
            })
            .collect();
        stats.candidates = merged.len();

        // Step 4: permission filter (visibility).
        let mut permitted: Vec<(MemoryId, f32, BTreeMap<&'static str, f32>)> = Vec::new();
        for (id, score, scores) in merged.drain(..) {
            let record = by_id[&id];
            stats.permission_checked += 1;
            if self.visible(record, &requesting) {
                stats.permission_passed += 1;
                permitted.push((id, score, scores));
            }
        }

        // Step 7 input: the post-permission candidate set.
        let facets = options
            .include_facets
            .then(|| compute_facets(permitted.iter().map(|(id, _, _)| by_id[id])));

        // Step 6: order and truncate.
        permitted.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        permitted.truncate(k);

        // Step 5: attach content.
        let mut results = Vec::with_capacity(permitted.len());
        for (id, score, scores) in permitted {
            let record = by_id[&id];
            let mut item = SearchResultItem {
                memory_id: id,
                score,
                mode_scores: scores,
                record: record.clone(),
                content: None,
                is_encrypted: record.encryption.is_encrypted(),
                decryption_failed: false,
                failure_reason: None,
            };
            if options.include_content {
                self.attach_content(&mut item, &requesting, &mut stats).await;
            }
            results.push(item);
        }

        debug!(
            results = results.len(),
            candidates = stats.candidates,
            "search complete"
        );
        Ok(SearchResponse {
            results,
            facets,
            buckets,
            stats,
        })
    }

    /// Weights over active modes, normalised to sum to one.
    fn mode_weights(&self, mode: SearchMode) -> BTreeMap<&'static str, f32> {
        let mut weights = BTreeMap::new();
        match mode {
            SearchMode::Vector => {
                weights.insert("vector", 1.0);
            }
            SearchMode::Keyword => {
                weights.insert("keyword", 1.0);
            }
            SearchMode::Graph => {
                weights.insert("graph", 1.0);
            }
            SearchMode::Temporal => {
                weights.insert("temporal", 1.0);
            }
            SearchMode::Hybrid => {
                weights.insert("vector", self.config.vector_weight);
                weights.insert("keyword", self.config.keyword_weight);
                weights.insert("graph", self.config.graph_weight);
                weights.insert("temporal", self.config.temporal_weight);
                let total: f32 = weights.values().sum();
                if total > 0.0 {
                    for value in weights.values_mut() {
                        *value /= total;
                    }
                }
            }
        }
        weights
    }

    /// Visibility rule for step 4: the owner always sees their own
    /// memories; other requesters need the permission predicate to pass for
    /// the record's (effective) identity.
    fn visible(&self, record: &MemoryRecord, requesting: &UserAddress) -> bool {
        if requesting == &record.owner {
            return true;
        }
        let Some(identity) = record_identity(record) else {
            // Plaintext record without an identity: owner-only.
            return false;
        };
        let target = effective_target(&identity, requesting);
        self.permission
            .allows(requesting, &target, Scope::ReadMemories)
    }

    /// Decrypted text for keyword matching; quietly skips what the
    /// requester cannot read.
    async fn readable_content(
        &self,
        record: &MemoryRecord,
        requesting: &UserAddress,
    ) -> Option<String> {
        let bytes = self.cache.get(&record.content_ref).await.ok()?;
        match &record.encryption {
            crate::types::EncryptionDescriptor::Plaintext => {
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            crate::types::EncryptionDescriptor::Ibe { identity, .. } => {
                let identity = IbeIdentity::parse(identity).ok()?;
                let target = effective_target(&identity, requesting);
                if !self
                    .permission
                    .allows(requesting, &target, Scope::ReadMemories)
                {
                    return None;
                }
                let plaintext = self
                    .envelope
                    .decrypt(&bytes, &IbeIdentity::owner(requesting.clone()))
                    .await
                    .ok()?;
                Some(String::from_utf8_lossy(&plaintext).into_owned())
            }
        }
    }

    /// Step 5: fetch, permission-gate and decrypt one result's content,
    /// annotating failures inline.
    async fn attach_content(
        &self,
        item: &mut SearchResultItem,
        requesting: &UserAddress,
        stats: &mut SearchStats,
    ) {
        let bytes = match self.cache.get(&item.record.content_ref).await {
            Ok(bytes) => bytes,
            Err(e) => {
                item.decryption_failed = true;
                item.failure_reason = Some(error_kind(&e));
                return;
            }
        };

        match &item.record.encryption {
            crate::types::EncryptionDescriptor::Plaintext => {
                item.content = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            crate::types::EncryptionDescriptor::Ibe { identity, .. } => {
                stats.decrypt_attempts += 1;
                let parsed = match IbeIdentity::parse(identity) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        stats.decrypt_failures += 1;
                        item.decryption_failed = true;
                        item.failure_reason = Some("InvalidCiphertext".into());
                        return;
                    }
                };
                let target = effective_target(&parsed, requesting);
                if !self
                    .permission
                    .allows(requesting, &target, Scope::ReadMemories)
                {
                    stats.decrypt_failures += 1;
                    item.decryption_failed = true;
                    item.failure_reason = Some("NoAccess".into());
                    return;
                }
                match self
                    .envelope
                    .decrypt(&bytes, &IbeIdentity::owner(requesting.clone()))
                    .await
                {
                    Ok(plaintext) => {
                        item.content = Some(String::from_utf8_lossy(&plaintext).into_owned());
                    }
                    Err(e) => {
                        stats.decrypt_failures += 1;
                        item.decryption_failed = true;
                        item.failure_reason = Some(error_kind(&e));
                    }
                }
            }
        }
    }
}

/// Parse the IBE identity stored on a record, if any.
#[must_use]
pub fn record_identity(record: &MemoryRecord) -> Option<IbeIdentity> {
    match &record.encryption {
        crate::types::EncryptionDescriptor::Plaintext => None,
        crate::types::EncryptionDescriptor::Ibe { identity, .. } => {
            IbeIdentity::parse(identity).ok()
        }
    }
}

/// Short error kind name for per-result annotations.
fn error_kind(error: &Error) -> String {
    match error {
        Error::NoAccess { .. } => "NoAccess".into(),
        Error::SessionExpired { .. } => "SessionExpired".into(),
        Error::IntegrityError => "IntegrityError".into(),
        Error::InconsistentKeyServers { .. } => "InconsistentKeyServers".into(),
        Error::InvalidCiphertext(_) => "InvalidCiphertext".into(),
        Error::DecryptionFailed(_) => "DecryptionFailed".into(),
        Error::KeyServerUnavailable(_) => "KeyServerUnavailable".into(),
        Error::StorageUnavailable(_) => "StorageUnavailable".into(),
        Error::NotFound(_) => "NotFound".into(),
        other => format!("{other:?}")
            .split(['(', ' ', '{'])
            .next()
            .unwrap_or("Error")
            .to_string(),
    }
}

/// Bucket label (UTC) for a timestamp.
fn bucket_label(created_ms: i64, bucket: TimeBucket) -> String {
    use chrono::{Datelike, TimeZone, Utc};
    let datetime = Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap());
    match bucket {
        TimeBucket::Day => datetime.format("%Y-%m-%d").to_string(),
        TimeBucket::Week => format!("{}-W{:02}", datetime.iso_week().year(), datetime.iso_week().week()),
        TimeBucket::Month => datetime.format("%Y-%m").to_string(),
    }
}

fn bucket_counts(records: &[&MemoryRecord], bucket: TimeBucket) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts
            .entry(bucket_label(record.created_at, bucket))
            .or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_punctuation_and_short_tokens() {
        assert_eq!(
            tokenize("What breed is my dog, Pepper?"),
            vec!["what", "breed", "is", "my", "dog", "pepper"]
        );
        assert_eq!(tokenize("a b!"), Vec::<String>::new());
    }

    #[test]
    fn effective_target_maps_foreign_readers_to_app_path() {
        let owner = UserAddress::new("0xu");
        let app = UserAddress::new("0xapp");
        let identity = IbeIdentity::owner(owner.clone());

        // Owner keeps the self path.
        assert_eq!(effective_target(&identity, &owner), identity);
        // A foreign reader is gated through app(owner, reader).
        assert_eq!(
            effective_target(&identity, &app),
            IbeIdentity::app(owner, app.clone())
        );

        // Non-self identities pass through unchanged.
        let timed = IbeIdentity::time(UserAddress::new("0xu"), 99);
        assert_eq!(effective_target(&timed, &app), timed);
    }

    #[test]
    fn bucket_labels() {
        // 2024-03-15T12:00:00Z
        let ms = 1_710_504_000_000;
        assert_eq!(bucket_label(ms, TimeBucket::Day), "2024-03-15");
        assert_eq!(bucket_label(ms, TimeBucket::Month), "2024-03");
        assert!(bucket_label(ms, TimeBucket::Week).starts_with("2024-W"));
    }
}
