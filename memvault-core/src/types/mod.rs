//! Common types shared across the memory plane.

mod config;

pub use config::{
    CacheConfig, EmbeddingConfig, IndexConfig, KeyServerConfig, KeyServerMode, MemvaultConfig,
    PipelineConfig, RetrievalConfig, SealConfig, Timeouts,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::blob::BlobAddress;

/// Blockchain address that owns per-user state.
///
/// Opaque to the core; first write for an address materialises the user's
/// index, graph and dedup state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAddress(String);

impl UserAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Globally unique, stable identifier of a memory.
///
/// Stable across updates: an update produces a new content blob but keeps
/// the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(Uuid);

impl MemoryId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classifier label for a memory. Small closed set plus `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Personal,
    Preference,
    Fact,
    Event,
    Task,
    Relationship,
    Other,
}

impl Category {
    /// All categories a classifier may emit.
    pub const ALL: [Category; 7] = [
        Category::Personal,
        Category::Preference,
        Category::Fact,
        Category::Event,
        Category::Task,
        Category::Relationship,
        Category::Other,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Personal => "personal",
            Category::Preference => "preference",
            Category::Fact => "fact",
            Category::Event => "event",
            Category::Task => "task",
            Category::Relationship => "relationship",
            Category::Other => "other",
        }
    }

    /// Parse a label; anything outside the closed set maps to `Other`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "personal" => Category::Personal,
            "preference" => Category::Preference,
            "fact" => Category::Fact,
            "event" => Category::Event,
            "task" => Category::Task,
            "relationship" => Category::Relationship,
            _ => Category::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a memory's content blob is protected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EncryptionDescriptor {
    /// Stored as-is.
    Plaintext,
    /// Sealed under an IBE identity string; `aad_hash` is the hex SHA-256 of
    /// plaintext bytes concatenated with the identity bytes.
    Ibe { identity: String, aad_hash: String },
}

impl EncryptionDescriptor {
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, EncryptionDescriptor::Ibe { .. })
    }
}

/// The atomic unit of the memory plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: MemoryId,
    pub owner: UserAddress,
    pub category: Category,
    /// Monotonic wall-clock milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    /// Importance in `[0, 1]`.
    pub importance: f32,
    pub tags: BTreeSet<String>,
    /// Address of the (usually encrypted) content blob.
    pub content_ref: BlobAddress,
    /// Index-local integer id, unique within the owner's vector index.
    /// `None` while the memory sits on the needs-reindex list.
    pub vector_ref: Option<u64>,
    /// Embedding model id; part of the embedding cache key.
    pub embedding_model: String,
    pub encryption: EncryptionDescriptor,
    /// Knowledge-graph node ids attached to this memory.
    pub graph_refs: BTreeSet<u64>,
}

impl MemoryRecord {
    /// Whether this record still needs a vector-index entry.
    #[must_use]
    pub fn needs_reindex(&self) -> bool {
        self.vector_ref.is_none()
    }
}

/// Why an utterance was not ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Classifier decided the utterance is not worth remembering.
    LowValue,
    /// Identical utterance seen within the dedup window.
    Duplicate,
    /// Classifier call failed or returned an unparsable reply.
    ClassifierError,
}

/// Domain outcome of an ingest call.
///
/// Infrastructure faults surface as [`crate::Error`]; this type only carries
/// the accepted/skipped decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted {
        memory_id: MemoryId,
        /// `None` when the vector enqueue was deferred to the needs-reindex
        /// list.
        vector_ref: Option<u64>,
        content_ref: BlobAddress,
    },
    Skipped {
        reason: SkipReason,
        /// Set for [`SkipReason::Duplicate`]: the memory the utterance
        /// coalesced into.
        existing_memory_id: Option<MemoryId>,
    },
}

impl IngestOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. })
    }

    /// The id of the accepted or deduplicated memory, if any.
    #[must_use]
    pub fn memory_id(&self) -> Option<MemoryId> {
        match self {
            IngestOutcome::Accepted { memory_id, .. } => Some(*memory_id),
            IngestOutcome::Skipped {
                existing_memory_id, ..
            } => *existing_memory_id,
        }
    }
}
