//! Facet counting over the post-permission candidate set.

use std::collections::BTreeMap;

use crate::types::MemoryRecord;

/// Facet counts keyed by value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facets {
    pub categories: BTreeMap<String, usize>,
    pub tags: BTreeMap<String, usize>,
}

/// Count category and tag facets over candidates.
///
/// Computed from the full post-permission candidate set, not the truncated
/// result slice, so counts reflect what filtering would yield.
#[must_use]
pub fn compute_facets<'a>(candidates: impl IntoIterator<Item = &'a MemoryRecord>) -> Facets {
    let mut facets = Facets::default();
    for record in candidates {
        *facets
            .categories
            .entry(record.category.as_str().to_string())
            .or_insert(0) += 1;
        for tag in &record.tags {
            *facets.tags.entry(tag.clone()).or_insert(0) += 1;
        }
    }
    facets
}
