//! The in-memory knowledge graph structure.
//!
//! Append-mostly: nodes are upserted by `(kind, normalised name)`, edges
//! deduplicate on `(from, to, label)` by incrementing weight. Every edge
//! endpoint must exist in the node table; the invariant is enforced on
//! mutation and re-checked when a checkpoint is loaded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};

/// A graph node: an extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: u64,
    pub kind: String,
    /// Display name as first observed (the index key is the normalised
    /// form).
    pub name: String,
    pub props: BTreeMap<String, String>,
}

/// A directed labelled edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: u64,
    pub to: u64,
    pub label: String,
    pub weight: f32,
    pub props: BTreeMap<String, String>,
}

/// A node set with the edges fully contained in it.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Lower-case and collapse whitespace for name comparison.
#[must_use]
pub fn normalise_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Serialisable per-user graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    nodes: BTreeMap<u64, GraphNode>,
    edges: Vec<GraphEdge>,
    name_index: HashMap<(String, String), u64>,
    next_node_id: u64,
    /// Edge indices incident to each node, rebuilt after deserialisation.
    #[serde(skip)]
    adjacency: HashMap<u64, Vec<usize>>,
}

impl KnowledgeGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn node(&self, id: u64) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    /// Upsert by `(kind, normalised name)`; new props are merged into an
    /// existing node. Returns the node id.
    pub fn upsert_node(
        &mut self,
        kind: &str,
        name: &str,
        props: BTreeMap<String, String>,
    ) -> u64 {
        let key = (kind.to_string(), normalise_name(name));
        if let Some(&id) = self.name_index.get(&key) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.props.extend(props);
            }
            return id;
        }
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.nodes.insert(
            id,
            GraphNode {
                id,
                kind: kind.to_string(),
                name: name.trim().to_string(),
                props,
            },
        );
        self.name_index.insert(key, id);
        id
    }

    /// Append an edge; a duplicate `(from, to, label)` increments the
    /// existing edge's weight instead of creating a parallel edge.
    pub fn add_edge(
        &mut self,
        from: u64,
        to: u64,
        label: &str,
        weight: f32,
        props: BTreeMap<String, String>,
    ) -> Result<()> {
        if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            return Err(Error::InvalidState(format!(
                "edge {from}->{to} references a missing node"
            )));
        }
        if let Some(edge) = self
            .edges
            .iter_mut()
            .find(|e| e.from == from && e.to == to && e.label == label)
        {
            edge.weight += weight;
            edge.props.extend(props);
            return Ok(());
        }
        let idx = self.edges.len();
        self.edges.push(GraphEdge {
            from,
            to,
            label: label.to_string(),
            weight,
            props,
        });
        self.adjacency.entry(from).or_default().push(idx);
        self.adjacency.entry(to).or_default().push(idx);
        Ok(())
    }

    /// Find node ids by name, optionally restricted to a kind.
    #[must_use]
    pub fn find_by_name(&self, name: &str, kind: Option<&str>) -> Vec<u64> {
        let normalised = normalise_name(name);
        match kind {
            Some(kind) => self
                .name_index
                .get(&(kind.to_string(), normalised))
                .copied()
                .into_iter()
                .collect(),
            None => {
                let mut ids: Vec<u64> = self
                    .name_index
                    .iter()
                    .filter(|((_, n), _)| *n == normalised)
                    .map(|(_, &id)| id)
                    .collect();
                ids.sort_unstable();
                ids
            }
        }
    }

    /// Breadth-first expansion from seed nodes, bounded by hop count and a
    /// global visit budget. Traverses edges in both directions; an edge
    /// filter restricts expansion to matching labels.
    #[must_use]
    pub fn neighbours(
        &self,
        seeds: &[u64],
        max_hops: usize,
        visit_budget: usize,
        edge_filter: Option<&str>,
    ) -> HashSet<u64> {
        let mut visited: HashSet<u64> = seeds
            .iter()
            .copied()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        let mut frontier: VecDeque<(u64, usize)> =
            visited.iter().map(|&id| (id, 0)).collect();
        let mut visits = visited.len();

        while let Some((id, hops)) = frontier.pop_front() {
            if hops >= max_hops {
                continue;
            }
            let Some(incident) = self.adjacency.get(&id) else {
                continue;
            };
            for &edge_idx in incident {
                let edge = &self.edges[edge_idx];
                if edge_filter.is_some_and(|label| edge.label != label) {
                    continue;
                }
                let other = if edge.from == id { edge.to } else { edge.from };
                if visited.contains(&other) {
                    continue;
                }
                if visits >= visit_budget {
                    return visited;
                }
                visited.insert(other);
                visits += 1;
                frontier.push_back((other, hops + 1));
            }
        }
        visited
    }

    /// Nodes and the edges fully contained within `node_ids`.
    #[must_use]
    pub fn subgraph(&self, node_ids: &[u64]) -> Subgraph {
        let wanted: HashSet<u64> = node_ids.iter().copied().collect();
        let nodes = node_ids
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        let edges = self
            .edges
            .iter()
            .filter(|e| wanted.contains(&e.from) && wanted.contains(&e.to))
            .cloned()
            .collect();
        Subgraph { nodes, edges }
    }

    /// Serialise to checkpoint bytes.
    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::SnapshotCodec(e.to_string()))
    }

    /// Rehydrate from checkpoint bytes, rebuilding adjacency and verifying
    /// that every edge endpoint resolves to a node.
    pub fn from_snapshot(bytes: &[u8]) -> std::result::Result<Self, String> {
        let mut graph: Self = postcard::from_bytes(bytes).map_err(|e| e.to_string())?;
        for (idx, edge) in graph.edges.iter().enumerate() {
            if !graph.nodes.contains_key(&edge.from) || !graph.nodes.contains_key(&edge.to) {
                return Err(format!(
                    "edge {idx} ({}->{}) references a missing node",
                    edge.from, edge.to
                ));
            }
        }
        graph.adjacency = HashMap::new();
        for (idx, edge) in graph.edges.iter().enumerate() {
            graph.adjacency.entry(edge.from).or_default().push(idx);
            graph.adjacency.entry(edge.to).or_default().push(idx);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn normalisation_collapses_case_and_whitespace() {
        assert_eq!(normalise_name("  My   Dog\tPepper "), "my dog pepper");
        assert_eq!(normalise_name("PEPPER"), "pepper");
    }

    #[test]
    fn upsert_reuses_matching_nodes() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("animal", "Pepper", props());
        let b = graph.upsert_node("animal", "  pepper ", props());
        let c = graph.upsert_node("person", "Pepper", props());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn duplicate_edges_increment_weight() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("person", "Ada", props());
        let b = graph.upsert_node("animal", "Pepper", props());
        graph.add_edge(a, b, "owns", 1.0, props()).unwrap();
        graph.add_edge(a, b, "owns", 0.5, props()).unwrap();
        graph.add_edge(a, b, "feeds", 1.0, props()).unwrap();
        assert_eq!(graph.edge_count(), 2);
        let sub = graph.subgraph(&[a, b]);
        let owns = sub.edges.iter().find(|e| e.label == "owns").unwrap();
        assert!((owns.weight - 1.5).abs() < 1e-6);
    }

    #[test]
    fn edges_to_missing_nodes_are_rejected() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("person", "Ada", props());
        assert!(graph.add_edge(a, 999, "knows", 1.0, props()).is_err());
    }

    #[test]
    fn bfs_respects_hops_and_budget() {
        let mut graph = KnowledgeGraph::new();
        // Chain: n0 - n1 - n2 - n3
        let ids: Vec<u64> = (0..4)
            .map(|i| graph.upsert_node("t", &format!("n{i}"), props()))
            .collect();
        for pair in ids.windows(2) {
            graph.add_edge(pair[0], pair[1], "next", 1.0, props()).unwrap();
        }

        let one_hop = graph.neighbours(&[ids[0]], 1, 100, None);
        assert_eq!(one_hop.len(), 2); // n0, n1

        let all = graph.neighbours(&[ids[0]], 10, 100, None);
        assert_eq!(all.len(), 4);

        let budgeted = graph.neighbours(&[ids[0]], 10, 2, None);
        assert_eq!(budgeted.len(), 2);
    }

    #[test]
    fn bfs_traverses_incoming_edges_too() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("t", "a", props());
        let b = graph.upsert_node("t", "b", props());
        graph.add_edge(b, a, "points-at", 1.0, props()).unwrap();
        let reached = graph.neighbours(&[a], 1, 100, None);
        assert!(reached.contains(&b));
    }

    #[test]
    fn edge_filter_limits_expansion() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("t", "a", props());
        let b = graph.upsert_node("t", "b", props());
        let c = graph.upsert_node("t", "c", props());
        graph.add_edge(a, b, "likes", 1.0, props()).unwrap();
        graph.add_edge(a, c, "owns", 1.0, props()).unwrap();
        let reached = graph.neighbours(&[a], 1, 100, Some("owns"));
        assert!(reached.contains(&c));
        assert!(!reached.contains(&b));
    }

    #[test]
    fn find_by_name_with_and_without_kind() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("animal", "Pepper", props());
        let p = graph.upsert_node("person", "Pepper", props());
        assert_eq!(graph.find_by_name("pepper", Some("animal")), vec![a]);
        let both = graph.find_by_name("Pepper", None);
        assert_eq!(both.len(), 2);
        assert!(both.contains(&a) && both.contains(&p));
    }

    #[test]
    fn snapshot_round_trip_verifies_edges() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.upsert_node("person", "Ada", props());
        let b = graph.upsert_node("animal", "Pepper", props());
        graph.add_edge(a, b, "owns", 1.0, props()).unwrap();

        let bytes = graph.to_snapshot().unwrap();
        let restored = KnowledgeGraph::from_snapshot(&bytes).unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.edge_count(), 1);
        // Adjacency was rebuilt.
        assert_eq!(restored.neighbours(&[a], 1, 10, None).len(), 2);

        let mut corrupt = bytes.clone();
        corrupt.truncate(corrupt.len() - 1);
        assert!(KnowledgeGraph::from_snapshot(&corrupt).is_err());
    }
}
