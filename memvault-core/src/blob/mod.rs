//! Content-addressed blob store abstraction.
//!
//! The transport (Walrus-style object store, on-disk store, in-process test
//! store) lives behind [`BlobStore`]; the core only relies on the contract:
//! addresses are deterministic functions of content bytes, `get` is
//! idempotent, `delete` may lag, and retention is epoch-based.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::retry::{RetryMetrics, RetryPolicy};

/// Maximum length of a blob address in characters.
pub const MAX_ADDRESS_LEN: usize = 128;

/// Opaque content address (lowercase hex SHA-256 in the bundled backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobAddress(String);

impl BlobAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the canonical content address for a byte string.
#[must_use]
pub fn content_address(bytes: &[u8]) -> BlobAddress {
    let digest = Sha256::digest(bytes);
    BlobAddress(hex::encode(digest))
}

/// Hex SHA-256 of arbitrary bytes; used for content hashes in tags and for
/// the dedup table.
#[must_use]
pub fn content_hash_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Metadata tag set stored alongside every blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobTags {
    pub owner: String,
    pub category: String,
    pub topic: Option<String>,
    pub importance: f32,
    pub content_type: String,
    pub content_size: u64,
    /// Hex SHA-256 of the stored bytes.
    pub content_hash: String,
    pub created_ms: i64,
    pub is_encrypted: bool,
    pub encryption_type: String,
    pub extra: BTreeMap<String, String>,
}

impl BlobTags {
    /// Minimal tag set for internal blobs (snapshots, checkpoints).
    #[must_use]
    pub fn internal(owner: &str, content_type: &str) -> Self {
        Self {
            owner: owner.to_string(),
            category: "internal".to_string(),
            topic: None,
            importance: 0.0,
            content_type: content_type.to_string(),
            content_size: 0,
            content_hash: String::new(),
            created_ms: 0,
            is_encrypted: false,
            encryption_type: "none".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// Receipt from a successful `put`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutReceipt {
    pub address: BlobAddress,
    pub size: u64,
    pub stored_at: i64,
    /// End of the retention epoch; blobs are eventually deleted after it.
    pub retention_epoch_end: u64,
}

/// A fetched blob with its tags.
#[derive(Debug, Clone)]
pub struct BlobObject {
    pub bytes: Vec<u8>,
    pub tags: BlobTags,
}

/// One page of a `list` scan.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub addresses: Vec<BlobAddress>,
    pub next_cursor: Option<String>,
}

/// Content-addressed put/get of opaque bytes with tagged metadata.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes; the returned address is a deterministic function of the
    /// content, so storing identical bytes twice yields the same address.
    async fn put(&self, bytes: Vec<u8>, tags: BlobTags) -> Result<PutReceipt>;

    /// Fetch bytes and tags. Fails with [`crate::Error::NotFound`] for
    /// unknown addresses.
    async fn get(&self, address: &BlobAddress) -> Result<BlobObject>;

    /// Fetch tags only; `None` for unknown addresses.
    async fn head(&self, address: &BlobAddress) -> Result<Option<BlobTags>>;

    /// Delete a blob. Deletion may lag; a successful delete followed by
    /// `head` must eventually observe `None`. Returns whether the address
    /// was known.
    async fn delete(&self, address: &BlobAddress) -> Result<bool>;

    /// List addresses owned by `owner`, optionally filtered by one tag
    /// key/value pair, paginated by an opaque cursor.
    async fn list(
        &self,
        owner: &str,
        tag_filter: Option<(&str, &str)>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage>;
}

/// Decorator applying the shared retry policy to a transport.
///
/// Only transport faults (`StorageUnavailable`, timeouts) are retried; the
/// wrapped store's semantic errors pass through untouched.
pub struct RetryingBlobStore {
    inner: Arc<dyn BlobStore>,
    policy: RetryPolicy,
    metrics: Arc<RetryMetrics>,
}

impl RetryingBlobStore {
    #[must_use]
    pub fn new(inner: Arc<dyn BlobStore>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            metrics: Arc::new(RetryMetrics::new()),
        }
    }

    /// Retry counters for the stats surface.
    #[must_use]
    pub fn metrics(&self) -> Arc<RetryMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl BlobStore for RetryingBlobStore {
    async fn put(&self, bytes: Vec<u8>, tags: BlobTags) -> Result<PutReceipt> {
        self.policy
            .execute(
                || self.inner.put(bytes.clone(), tags.clone()),
                Some(&self.metrics),
            )
            .await
    }

    async fn get(&self, address: &BlobAddress) -> Result<BlobObject> {
        self.policy
            .execute(|| self.inner.get(address), Some(&self.metrics))
            .await
    }

    async fn head(&self, address: &BlobAddress) -> Result<Option<BlobTags>> {
        self.policy
            .execute(|| self.inner.head(address), Some(&self.metrics))
            .await
    }

    async fn delete(&self, address: &BlobAddress) -> Result<bool> {
        self.policy
            .execute(|| self.inner.delete(address), Some(&self.metrics))
            .await
    }

    async fn list(
        &self,
        owner: &str,
        tag_filter: Option<(&str, &str)>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        self.policy
            .execute(
                || self.inner.list(owner, tag_filter, limit, cursor),
                Some(&self.metrics),
            )
            .await
    }
}
