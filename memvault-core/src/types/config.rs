//! Configuration tree for the memory plane.
//!
//! The closed set of knobs the host may tune. Every section has sane
//! defaults from [`crate::constants`]; hosts typically deserialize this
//! from their own TOML/JSON config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::*;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemvaultConfig {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub seal: SealConfig,
    pub retrieval: RetrievalConfig,
    pub pipeline: PipelineConfig,
    pub timeouts: Timeouts,
}

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model id; recorded in each memory and part of the memo-cache key.
    pub model: String,
    pub batch_size: usize,
    pub batch_age: Duration,
    /// Requests-per-minute budget for the token bucket.
    pub rpm: u32,
    /// Memo cache capacity in entries.
    pub cache_entries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "hash-embedder-384".to_string(),
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            batch_age: DEFAULT_EMBEDDING_BATCH_AGE,
            rpm: DEFAULT_EMBEDDING_RPM,
            cache_entries: DEFAULT_EMBEDDING_CACHE_ENTRIES,
        }
    }
}

/// Per-user vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub batch_size: usize,
    pub batch_age: Duration,
    /// Pending adds that force a snapshot.
    pub snapshot_threshold: usize,
    /// Idle time that forces a snapshot.
    pub snapshot_idle: Duration,
    /// HNSW graph degree.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search_default: usize,
    /// Warm index idle time before eviction back to cold.
    pub idle_eviction: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_INDEX_BATCH_SIZE,
            batch_age: DEFAULT_INDEX_BATCH_AGE,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            snapshot_idle: DEFAULT_SNAPSHOT_IDLE,
            m: DEFAULT_HNSW_M,
            ef_construction: DEFAULT_HNSW_EF_CONSTRUCTION,
            ef_search_default: DEFAULT_HNSW_EF_SEARCH,
            idle_eviction: DEFAULT_INDEX_IDLE_EVICTION,
        }
    }
}

/// Content cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_entries: usize,
    pub l2_bytes: usize,
    /// Advisory TTL; bounds working-set growth, never correctness.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_entries: DEFAULT_CACHE_L1_ENTRIES,
            l2_bytes: DEFAULT_CACHE_L2_BYTES,
            ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Key-server operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyServerMode {
    /// Serves shares to any holder of a valid session key.
    Open,
    /// Requires an allow-listed package id.
    Permissioned,
}

/// One configured key-share holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyServerConfig {
    pub object_id: String,
    pub url: String,
    pub weight: u32,
    pub mode: KeyServerMode,
}

/// Encryption envelope configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
    pub session_ttl_min: u64,
    /// Ordered list of key-share holders. Empty means "use the default set
    /// the envelope was built with".
    pub servers: Vec<KeyServerConfig>,
    /// Weighted quorum threshold T.
    pub quorum: u32,
    /// Verify server identities on session creation.
    pub verify_servers: bool,
    /// Package id the session keys are bound to (hex).
    pub package_id: String,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            session_ttl_min: DEFAULT_SESSION_TTL_MIN,
            servers: Vec::new(),
            quorum: DEFAULT_SEAL_QUORUM,
            verify_servers: true,
            package_id: "0x4d564c54".to_string(),
        }
    }
}

/// Retrieval engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    /// Minimum vector similarity for a result to count.
    pub threshold: f32,
    /// Hybrid mode weights; normalised over the active modes at query time.
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub graph_weight: f32,
    pub temporal_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: DEFAULT_RETRIEVAL_K,
            threshold: DEFAULT_RETRIEVAL_THRESHOLD,
            vector_weight: 0.6,
            keyword_weight: 0.2,
            graph_weight: 0.15,
            temporal_weight: 0.05,
        }
    }
}

/// Ingestion pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sliding window for exact-utterance dedup.
    pub dedup_window: Duration,
    /// Soft cap on pending batcher items per kind.
    pub max_pending: usize,
    /// How long `enqueue` blocks under back-pressure before failing.
    pub enqueue_timeout: Duration,
    /// Graph mutations between automatic checkpoints.
    pub graph_checkpoint_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            max_pending: DEFAULT_BATCHER_MAX_PENDING,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            graph_checkpoint_every: DEFAULT_GRAPH_CHECKPOINT_EVERY,
        }
    }
}

/// Timeouts for external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub embed: Duration,
    pub blob: Duration,
    pub key_server: Duration,
    pub llm: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            embed: DEFAULT_EMBED_TIMEOUT,
            blob: DEFAULT_BLOB_TIMEOUT,
            key_server: DEFAULT_KEY_SERVER_TIMEOUT,
            llm: DEFAULT_LLM_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MemvaultConfig::default();
        assert_eq!(config.embedding.batch_size, 20);
        assert_eq!(config.embedding.batch_age, Duration::from_millis(5000));
        assert_eq!(config.embedding.rpm, 1500);
        assert_eq!(config.index.batch_size, 50);
        assert_eq!(config.index.snapshot_threshold, 200);
        assert_eq!(config.cache.ttl, Duration::from_millis(3_600_000));
        assert_eq!(config.seal.session_ttl_min, 60);
        assert_eq!(config.retrieval.default_k, 10);
        assert!((config.retrieval.threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.pipeline.dedup_window, Duration::from_secs(600));
    }

    #[test]
    fn config_json_round_trip() {
        let config = MemvaultConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MemvaultConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index.m, config.index.m);
        assert_eq!(back.seal.package_id, config.seal.package_id);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let back: MemvaultConfig =
            serde_json::from_str(r#"{"retrieval": {"default_k": 25}}"#).unwrap();
        assert_eq!(back.retrieval.default_k, 25);
        assert_eq!(back.embedding.batch_size, 20);
    }
}
