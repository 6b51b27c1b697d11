//! Search filter parsing and matching.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Category, MemoryRecord};

/// Faceted filters applied to every search mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Empty means all categories.
    pub categories: Vec<Category>,
    /// Inclusive `created_at` range in milliseconds.
    pub date_range: Option<(i64, i64)>,
    /// Inclusive importance range within `[0, 1]`.
    pub importance_range: Option<(f32, f32)>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
    /// Minimum vector similarity; falls back to the configured threshold.
    pub similarity_threshold: Option<f32>,
}

impl SearchFilters {
    /// Validate ranges before running any mode.
    pub fn validate(&self) -> Result<()> {
        if let Some((from, to)) = self.date_range {
            if from > to {
                return Err(Error::InvalidInput(format!(
                    "date_range start {from} after end {to}"
                )));
            }
        }
        if let Some((low, high)) = self.importance_range {
            if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
                return Err(Error::InvalidInput(format!(
                    "importance_range [{low}, {high}] outside [0, 1]"
                )));
            }
        }
        if let Some(threshold) = self.similarity_threshold {
            if !(-1.0..=1.0).contains(&threshold) {
                return Err(Error::InvalidInput(format!(
                    "similarity threshold {threshold} outside [-1, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Whether a record passes every active filter.
    #[must_use]
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&record.category) {
            return false;
        }
        if let Some((from, to)) = self.date_range {
            if record.created_at < from || record.created_at > to {
                return false;
            }
        }
        if let Some((low, high)) = self.importance_range {
            if record.importance < low || record.importance > high {
                return false;
            }
        }
        self.tags.iter().all(|tag| record.tags.contains(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobAddress;
    use crate::types::{EncryptionDescriptor, MemoryId, UserAddress};
    use std::collections::BTreeSet;

    fn record() -> MemoryRecord {
        MemoryRecord {
            memory_id: MemoryId::generate(),
            owner: UserAddress::new("0xa"),
            category: Category::Personal,
            created_at: 1_000,
            updated_at: 1_000,
            importance: 0.7,
            tags: ["pets".to_string(), "dog".to_string()].into_iter().collect::<BTreeSet<_>>(),
            content_ref: BlobAddress::new("aa"),
            vector_ref: Some(0),
            embedding_model: "m".into(),
            encryption: EncryptionDescriptor::Plaintext,
            graph_refs: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(SearchFilters::default().matches(&record()));
    }

    #[test]
    fn category_filter() {
        let mut filters = SearchFilters {
            categories: vec![Category::Fact],
            ..Default::default()
        };
        assert!(!filters.matches(&record()));
        filters.categories.push(Category::Personal);
        assert!(filters.matches(&record()));
    }

    #[test]
    fn date_and_importance_ranges() {
        let filters = SearchFilters {
            date_range: Some((0, 999)),
            ..Default::default()
        };
        assert!(!filters.matches(&record()));

        let filters = SearchFilters {
            date_range: Some((1_000, 2_000)),
            importance_range: Some((0.5, 0.8)),
            ..Default::default()
        };
        assert!(filters.matches(&record()));
    }

    #[test]
    fn tag_filter_requires_all() {
        let filters = SearchFilters {
            tags: vec!["pets".into(), "dog".into()],
            ..Default::default()
        };
        assert!(filters.matches(&record()));
        let filters = SearchFilters {
            tags: vec!["pets".into(), "cat".into()],
            ..Default::default()
        };
        assert!(!filters.matches(&record()));
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        assert!(SearchFilters {
            date_range: Some((10, 5)),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(SearchFilters {
            importance_range: Some((0.9, 0.2)),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(SearchFilters {
            importance_range: Some((0.0, 1.5)),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(SearchFilters::default().validate().is_ok());
    }
}
