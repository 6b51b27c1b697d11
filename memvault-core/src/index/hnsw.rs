//! Hierarchical navigable small-world index over unit vectors.
//!
//! Cosine metric: vectors are unit-normalised on insert and scored by dot
//! product. Level sampling is derived deterministically from the index seed
//! and the vector id, so a snapshot round-trip rebuilds identical structure.
//! Removal is a soft delete: the node keeps its links (they still serve as
//! routing waypoints) but is skipped in results.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::embeddings::normalize;
use crate::error::{Error, Result};
use crate::types::MemoryId;

/// Index parameters, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub dimension: usize,
    /// Graph degree at upper levels; level 0 allows `2 * m`.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search_default: usize,
}

impl HnswParams {
    fn max_degree(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// Metadata carried with every vector entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMeta {
    pub memory_id: MemoryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: u64,
    vector: Vec<f32>,
    meta: VectorMeta,
    /// Neighbor slots per level, `neighbors[0]` being the base layer.
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub vector_id: u64,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    pub meta: VectorMeta,
}

/// Max-heap candidate ordered by similarity, ties broken by lower slot.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    sim: f32,
    slot: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sim
            .partial_cmp(&other.sim)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The serialisable HNSW index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    params: HnswParams,
    nodes: Vec<Node>,
    id_to_slot: HashMap<u64, u32>,
    entry: Option<u32>,
    max_level: usize,
    level_seed: u64,
    live: usize,
}

impl HnswIndex {
    #[must_use]
    pub fn new(params: HnswParams, level_seed: u64) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            id_to_slot: HashMap::new(),
            entry: None,
            max_level: 0,
            level_seed,
            live: 0,
        }
    }

    #[must_use]
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of live (non-deleted) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[must_use]
    pub fn contains(&self, vector_id: u64) -> bool {
        self.id_to_slot
            .get(&vector_id)
            .is_some_and(|slot| !self.nodes[*slot as usize].deleted)
    }

    /// Insert a vector under a unique id.
    pub fn insert(&mut self, vector_id: u64, mut vector: Vec<f32>, meta: VectorMeta) -> Result<()> {
        if vector.len() != self.params.dimension {
            return Err(Error::InvalidInput(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.params.dimension
            )));
        }
        if self.contains(vector_id) {
            return Err(Error::InvalidState(format!(
                "vector id {vector_id} already present in index"
            )));
        }
        normalize(&mut vector);

        let level = self.sample_level(vector_id);
        let slot = self.nodes.len() as u32;
        self.nodes.push(Node {
            id: vector_id,
            vector,
            meta,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.id_to_slot.insert(vector_id, slot);
        self.live += 1;

        let Some(mut current) = self.entry else {
            self.entry = Some(slot);
            self.max_level = level;
            return Ok(());
        };

        let query = self.nodes[slot as usize].vector.clone();

        // Greedy descent through levels above the new node's level.
        let mut layer = self.max_level;
        while layer > level {
            current = self.greedy_closest(&query, current, layer);
            layer -= 1;
        }

        // Connect on each level from min(max_level, level) down to 0.
        let mut layer = level.min(self.max_level);
        loop {
            let candidates = self.search_layer(&query, &[current], layer, self.params.ef_construction);
            let degree = self.params.max_degree(layer);
            let chosen: Vec<u32> = candidates
                .iter()
                .filter(|c| c.slot != slot)
                .take(degree)
                .map(|c| c.slot)
                .collect();

            for &neighbor in &chosen {
                self.nodes[slot as usize].neighbors[layer].push(neighbor);
                self.nodes[neighbor as usize].neighbors[layer].push(slot);
                self.prune(neighbor, layer);
            }
            if let Some(best) = chosen.first() {
                current = *best;
            }
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(slot);
        }
        Ok(())
    }

    /// Soft-delete an entry; its links remain as routing waypoints.
    /// Returns whether the id was present and live.
    pub fn remove(&mut self, vector_id: u64) -> bool {
        let Some(&slot) = self.id_to_slot.get(&vector_id) else {
            return false;
        };
        let node = &mut self.nodes[slot as usize];
        if node.deleted {
            return false;
        }
        node.deleted = true;
        self.live -= 1;
        true
    }

    /// k-nearest search with an explicit beam width.
    ///
    /// Results are ordered by score descending, `vector_id` ascending on
    /// ties, and truncated to `k`.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<VectorHit> {
        if k == 0 || self.entry.is_none() || query.len() != self.params.dimension {
            return Vec::new();
        }
        let mut query = query.to_vec();
        normalize(&mut query);

        let mut current = self.entry.unwrap();
        let mut layer = self.max_level;
        while layer > 0 {
            current = self.greedy_closest(&query, current, layer);
            layer -= 1;
        }

        let ef = ef.max(k);
        let candidates = self.search_layer(&query, &[current], 0, ef);

        let mut hits: Vec<VectorHit> = candidates
            .into_iter()
            .filter(|c| !self.nodes[c.slot as usize].deleted)
            .map(|c| {
                let node = &self.nodes[c.slot as usize];
                VectorHit {
                    vector_id: node.id,
                    score: c.sim,
                    meta: node.meta.clone(),
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(k);
        hits
    }

    /// Deterministic level for a vector id under this index's seed.
    fn sample_level(&self, vector_id: u64) -> usize {
        let mut rng = ChaCha8Rng::seed_from_u64(self.level_seed ^ vector_id);
        let uniform: f64 = rng.gen_range(f64::EPSILON..1.0);
        let ml = 1.0 / (self.params.m as f64).ln();
        (-uniform.ln() * ml).floor() as usize
    }

    fn similarity(&self, query: &[f32], slot: u32) -> f32 {
        let vector = &self.nodes[slot as usize].vector;
        query.iter().zip(vector.iter()).map(|(a, b)| a * b).sum()
    }

    /// Greedy walk to the locally closest node on one layer.
    fn greedy_closest(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_sim = self.similarity(query, current);
        loop {
            let mut improved = false;
            let neighbors = &self.nodes[current as usize].neighbors;
            if layer < neighbors.len() {
                for &neighbor in &neighbors[layer] {
                    let sim = self.similarity(query, neighbor);
                    if sim > current_sim {
                        current = neighbor;
                        current_sim = sim;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first beam search on one layer; returns up to `ef` candidates
    /// sorted by similarity descending.
    fn search_layer(&self, query: &[f32], entries: &[u32], layer: usize, ef: usize) -> Vec<Candidate> {
        let mut visited: HashSet<u32> = entries.iter().copied().collect();
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();
        // Min-heap over the current best set, via reversed ordering.
        let mut best: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();

        for &slot in entries {
            let candidate = Candidate {
                sim: self.similarity(query, slot),
                slot,
            };
            frontier.push(candidate);
            best.push(std::cmp::Reverse(candidate));
        }

        while let Some(candidate) = frontier.pop() {
            let worst = best.peek().map_or(f32::MIN, |r| r.0.sim);
            if best.len() >= ef && candidate.sim < worst {
                break;
            }
            let neighbors = &self.nodes[candidate.slot as usize].neighbors;
            if layer >= neighbors.len() {
                continue;
            }
            for &neighbor in &neighbors[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let sim = self.similarity(query, neighbor);
                let worst = best.peek().map_or(f32::MIN, |r| r.0.sim);
                if best.len() < ef || sim > worst {
                    let next = Candidate { sim, slot: neighbor };
                    frontier.push(next);
                    best.push(std::cmp::Reverse(next));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut results: Vec<Candidate> = best.into_iter().map(|r| r.0).collect();
        results.sort_by(|a, b| b.cmp(a));
        results
    }

    /// Trim a node's neighbor list back to the level's max degree, keeping
    /// the closest links.
    fn prune(&mut self, slot: u32, layer: usize) {
        let degree = self.params.max_degree(layer);
        let list = self.nodes[slot as usize].neighbors[layer].clone();
        if list.len() <= degree {
            return;
        }
        let anchor = self.nodes[slot as usize].vector.clone();
        let mut scored: Vec<(f32, u32)> = list
            .into_iter()
            .map(|n| (self.similarity(&anchor, n), n))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.truncate(degree);
        self.nodes[slot as usize].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
    }

    /// Serialise to snapshot bytes.
    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::SnapshotCodec(e.to_string()))
    }

    /// Rehydrate from snapshot bytes.
    pub fn from_snapshot(bytes: &[u8]) -> std::result::Result<Self, String> {
        postcard::from_bytes(bytes).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dimension: usize) -> HnswParams {
        HnswParams {
            dimension,
            m: 8,
            ef_construction: 64,
            ef_search_default: 50,
        }
    }

    fn meta() -> VectorMeta {
        VectorMeta {
            memory_id: MemoryId::generate(),
        }
    }

    /// Axis-aligned unit vector with some noise in the remaining dims.
    fn clustered_vector(dimension: usize, axis: usize, noise: f32, salt: u64) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis] = 1.0;
        for (i, value) in v.iter_mut().enumerate() {
            let wiggle = ((salt.wrapping_mul(31).wrapping_add(i as u64) % 17) as f32 / 17.0 - 0.5)
                * noise;
            *value += wiggle;
        }
        v
    }

    #[test]
    fn exact_match_is_top_hit() {
        let mut index = HnswIndex::new(params(8), 42);
        for i in 0..50u64 {
            index
                .insert(i, clustered_vector(8, (i % 4) as usize, 0.2, i), meta())
                .unwrap();
        }
        let query = clustered_vector(8, 2, 0.2, 6); // same as id 6 (6 % 4 == 2)
        let hits = index.search(&query, 5, 50);
        assert_eq!(hits[0].vector_id, 6);
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn search_respects_k_and_ordering() {
        let mut index = HnswIndex::new(params(4), 1);
        for i in 0..20u64 {
            index
                .insert(i, clustered_vector(4, (i % 2) as usize, 0.1, i), meta())
                .unwrap();
        }
        let hits = index.search(&clustered_vector(4, 0, 0.0, 0), 7, 50);
        assert!(hits.len() <= 7);
        for pair in hits.windows(2) {
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score
                        && pair[0].vector_id < pair[1].vector_id)
            );
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut index = HnswIndex::new(params(4), 7);
        index.insert(1, vec![1.0, 0.0, 0.0, 0.0], meta()).unwrap();
        let err = index.insert(1, vec![0.0, 1.0, 0.0, 0.0], meta()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = HnswIndex::new(params(4), 7);
        let err = index.insert(1, vec![1.0, 0.0], meta()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn removed_entries_are_skipped() {
        let mut index = HnswIndex::new(params(4), 3);
        for i in 0..10u64 {
            index
                .insert(i, clustered_vector(4, 0, 0.05, i), meta())
                .unwrap();
        }
        assert!(index.remove(3));
        assert!(!index.remove(3));
        assert_eq!(index.len(), 9);

        let hits = index.search(&clustered_vector(4, 0, 0.0, 0), 10, 64);
        assert!(hits.iter().all(|h| h.vector_id != 3));
    }

    #[test]
    fn snapshot_round_trip_preserves_results() {
        let mut index = HnswIndex::new(params(16), 99);
        for i in 0..120u64 {
            index
                .insert(i, clustered_vector(16, (i % 8) as usize, 0.3, i), meta())
                .unwrap();
        }
        let query = clustered_vector(16, 5, 0.1, 1000);
        let before = index.search(&query, 10, 80);

        let bytes = index.to_snapshot().unwrap();
        let restored = HnswIndex::from_snapshot(&bytes).unwrap();
        let after = restored.search(&query, 10, 80);

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.vector_id, b.vector_id);
        }
        assert_eq!(index.len(), restored.len());
    }

    #[test]
    fn corrupt_snapshot_fails_to_decode() {
        let mut index = HnswIndex::new(params(4), 5);
        index.insert(0, vec![1.0, 0.0, 0.0, 0.0], meta()).unwrap();
        let mut bytes = index.to_snapshot().unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(HnswIndex::from_snapshot(&bytes).is_err());
    }

    #[test]
    fn recall_on_clustered_data() {
        // Every query drawn from a cluster should find mostly same-cluster
        // neighbors.
        let dimension = 24;
        let mut index = HnswIndex::new(params(dimension), 2024);
        for i in 0..400u64 {
            let axis = (i % 6) as usize;
            index
                .insert(i, clustered_vector(dimension, axis, 0.4, i), meta())
                .unwrap();
        }
        let query = clustered_vector(dimension, 3, 0.0, 9999);
        let hits = index.search(&query, 20, 100);
        assert_eq!(hits.len(), 20);
        let same_cluster = hits.iter().filter(|h| h.vector_id % 6 == 3).count();
        assert!(
            same_cluster >= 15,
            "expected mostly cluster-3 hits, got {same_cluster}/20"
        );
    }
}
