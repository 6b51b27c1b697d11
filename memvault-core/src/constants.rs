//! System-wide defaults for the memory plane.
//!
//! Values here are the fallbacks baked into the `Default` impls in
//! [`crate::types::config`]; hosts override them through the config tree.

use std::time::Duration;

/// Default embedding batch size before a batch is dispatched.
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 20;

/// Default maximum age of the oldest queued embedding before dispatch.
pub const DEFAULT_EMBEDDING_BATCH_AGE: Duration = Duration::from_millis(5000);

/// Default embedding requests-per-minute budget.
pub const DEFAULT_EMBEDDING_RPM: u32 = 1500;

/// Default vector-add batch size.
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 50;

/// Default maximum age of the oldest queued vector add before dispatch.
pub const DEFAULT_INDEX_BATCH_AGE: Duration = Duration::from_millis(3000);

/// Pending adds that trigger an automatic index snapshot.
pub const DEFAULT_SNAPSHOT_THRESHOLD: usize = 200;

/// Idle time that triggers an automatic index snapshot.
pub const DEFAULT_SNAPSHOT_IDLE: Duration = Duration::from_millis(60_000);

/// Default HNSW graph degree.
pub const DEFAULT_HNSW_M: usize = 16;

/// Default HNSW construction beam width.
pub const DEFAULT_HNSW_EF_CONSTRUCTION: usize = 200;

/// Default HNSW search beam width floor.
pub const DEFAULT_HNSW_EF_SEARCH: usize = 50;

/// Default L1 content-cache capacity in entries.
pub const DEFAULT_CACHE_L1_ENTRIES: usize = 512;

/// Default L2 content-cache capacity in bytes.
pub const DEFAULT_CACHE_L2_BYTES: usize = 32 * 1024 * 1024;

/// Advisory TTL for content-cache entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(3_600_000);

/// Default session-key lifetime in minutes.
pub const DEFAULT_SESSION_TTL_MIN: u64 = 60;

/// Default weighted quorum threshold for key-share aggregation.
pub const DEFAULT_SEAL_QUORUM: u32 = 2;

/// Default number of results returned by retrieval.
pub const DEFAULT_RETRIEVAL_K: usize = 10;

/// Default similarity threshold for vector retrieval.
pub const DEFAULT_RETRIEVAL_THRESHOLD: f32 = 0.6;

/// Sliding window within which identical utterances are deduplicated.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(600);

/// TTL for cached permission decisions.
pub const DEFAULT_PERMISSION_TTL: Duration = Duration::from_secs(30);

/// Soft cap on pending batcher items per kind before eager flushing.
pub const DEFAULT_BATCHER_MAX_PENDING: usize = 1000;

/// How long `enqueue` blocks under back-pressure before failing.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded attempt count for transport-layer retries.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Warm index idle time before LRU eviction back to cold.
pub const DEFAULT_INDEX_IDLE_EVICTION: Duration = Duration::from_secs(900);

/// Global node-visit budget for graph BFS queries.
pub const DEFAULT_GRAPH_VISIT_BUDGET: usize = 10_000;

/// Graph mutations between automatic checkpoints.
pub const DEFAULT_GRAPH_CHECKPOINT_EVERY: usize = 64;

/// Default embedding memo-cache capacity in entries.
pub const DEFAULT_EMBEDDING_CACHE_ENTRIES: usize = 4096;

/// External-call timeouts.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BLOB_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEY_SERVER_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);
