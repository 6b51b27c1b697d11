//! Per-user knowledge graph.
//!
//! - `store`: the directed labelled multigraph and its traversal queries
//! - `extract`: LLM-backed entity/relationship extraction
//! - `manager`: per-user lifecycle with durable checkpoints

mod extract;
mod manager;
mod store;

pub use extract::{ExtractedEdge, ExtractedNode, Extraction, GraphExtractor};
pub use manager::{GraphManager, GraphManagerStats, UserGraphStats};
pub use store::{normalise_name, GraphEdge, GraphNode, KnowledgeGraph, Subgraph};
