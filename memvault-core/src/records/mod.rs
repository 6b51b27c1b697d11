//! Owner-local tabular metadata store.
//!
//! One row per memory, kept until explicit delete. The trait keeps the
//! core independent of how a host persists rows; the bundled in-memory
//! implementation backs tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{MemoryId, MemoryRecord, UserAddress};

/// Tabular persistence of memory records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record (keyed by owner + memory id).
    async fn upsert(&self, record: MemoryRecord) -> Result<()>;

    /// Fetch one record.
    async fn get(&self, owner: &UserAddress, memory_id: MemoryId) -> Result<Option<MemoryRecord>>;

    /// Delete one record; returns whether it existed.
    async fn delete(&self, owner: &UserAddress, memory_id: MemoryId) -> Result<bool>;

    /// All records for an owner, ordered by `created_at` then id.
    async fn list_owner(&self, owner: &UserAddress) -> Result<Vec<MemoryRecord>>;

    /// Total row count (stats surface).
    async fn count(&self) -> Result<usize>;
}

/// In-memory record store.
#[derive(Default)]
pub struct InMemoryRecordStore {
    rows: RwLock<HashMap<UserAddress, HashMap<MemoryId, MemoryRecord>>>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, record: MemoryRecord) -> Result<()> {
        self.rows
            .write()
            .entry(record.owner.clone())
            .or_default()
            .insert(record.memory_id, record);
        Ok(())
    }

    async fn get(&self, owner: &UserAddress, memory_id: MemoryId) -> Result<Option<MemoryRecord>> {
        Ok(self
            .rows
            .read()
            .get(owner)
            .and_then(|rows| rows.get(&memory_id))
            .cloned())
    }

    async fn delete(&self, owner: &UserAddress, memory_id: MemoryId) -> Result<bool> {
        Ok(self
            .rows
            .write()
            .get_mut(owner)
            .is_some_and(|rows| rows.remove(&memory_id).is_some()))
    }

    async fn list_owner(&self, owner: &UserAddress) -> Result<Vec<MemoryRecord>> {
        let mut records: Vec<MemoryRecord> = self
            .rows
            .read()
            .get(owner)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.memory_id.cmp(&b.memory_id))
        });
        Ok(records)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().values().map(HashMap::len).sum())
    }
}

/// Fetch a record or fail with [`Error::NotFound`].
pub async fn require_record(
    store: &dyn RecordStore,
    owner: &UserAddress,
    memory_id: MemoryId,
) -> Result<MemoryRecord> {
    store
        .get(owner, memory_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("memory {memory_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobAddress;
    use crate::types::{Category, EncryptionDescriptor};
    use std::collections::BTreeSet;

    fn record(owner: &UserAddress, created_at: i64) -> MemoryRecord {
        MemoryRecord {
            memory_id: MemoryId::generate(),
            owner: owner.clone(),
            category: Category::Personal,
            created_at,
            updated_at: created_at,
            importance: 0.5,
            tags: BTreeSet::new(),
            content_ref: BlobAddress::new("aa"),
            vector_ref: Some(1),
            embedding_model: "m".into(),
            encryption: EncryptionDescriptor::Plaintext,
            graph_refs: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn upsert_get_delete_cycle() {
        let store = InMemoryRecordStore::new();
        let owner = UserAddress::new("0xa");
        let row = record(&owner, 10);
        store.upsert(row.clone()).await.unwrap();

        let fetched = store.get(&owner, row.memory_id).await.unwrap().unwrap();
        assert_eq!(fetched, row);

        assert!(store.delete(&owner, row.memory_id).await.unwrap());
        assert!(!store.delete(&owner, row.memory_id).await.unwrap());
        assert!(store.get(&owner, row.memory_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_ordered_and_owner_scoped() {
        let store = InMemoryRecordStore::new();
        let a = UserAddress::new("0xa");
        let b = UserAddress::new("0xb");
        store.upsert(record(&a, 30)).await.unwrap();
        store.upsert(record(&a, 10)).await.unwrap();
        store.upsert(record(&b, 20)).await.unwrap();

        let rows = store.list_owner(&a).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].created_at <= rows[1].created_at);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn require_record_maps_missing_to_not_found() {
        let store = InMemoryRecordStore::new();
        let owner = UserAddress::new("0xa");
        let err = require_record(&store, &owner, MemoryId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
