//! Graph manager: one warm knowledge graph per active user, checkpointed
//! to the blob store.
//!
//! Mutations accumulate in memory and are checkpointed every N mutations or
//! on idle flush; a successful `checkpoint` return means the on-blob graph
//! reflects all prior adds for that user.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::blob::{BlobAddress, BlobStore, BlobTags};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::graph::extract::Extraction;
use crate::graph::store::{KnowledgeGraph, Subgraph};
use crate::types::UserAddress;

/// Content type tag for graph checkpoint blobs.
pub const CHECKPOINT_CONTENT_TYPE: &str = "application/x-memvault-graph";

struct WarmGraph {
    graph: KnowledgeGraph,
    /// Mutations since the last checkpoint.
    dirty: usize,
    last_used: Instant,
    last_mutation: Instant,
    checkpoint_ref: Option<BlobAddress>,
}

#[derive(Default)]
struct GraphSlot {
    warm: RwLock<Option<WarmGraph>>,
    load_flight: tokio::sync::Mutex<()>,
}

/// Per-user stats row.
#[derive(Debug, Clone)]
pub struct UserGraphStats {
    pub user: UserAddress,
    pub warm: bool,
    pub nodes: usize,
    pub edges: usize,
    pub pending_checkpoint: usize,
}

/// Aggregate stats for the stats surface.
#[derive(Debug, Clone, Default)]
pub struct GraphManagerStats {
    pub users: Vec<UserGraphStats>,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
}

/// Manages per-user knowledge graphs with durable checkpoints.
pub struct GraphManager {
    store: Arc<dyn BlobStore>,
    clock: SharedClock,
    /// Mutations between automatic checkpoints.
    checkpoint_every: usize,
    idle_flush: std::time::Duration,
    visit_budget: usize,
    slots: Mutex<HashMap<UserAddress, Arc<GraphSlot>>>,
    counters: Mutex<(u64, u64)>,
}

impl GraphManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn BlobStore>,
        clock: SharedClock,
        checkpoint_every: usize,
        idle_flush: std::time::Duration,
        visit_budget: usize,
    ) -> Self {
        Self {
            store,
            clock,
            checkpoint_every: checkpoint_every.max(1),
            idle_flush,
            visit_budget,
            slots: Mutex::new(HashMap::new()),
            counters: Mutex::new((0, 0)),
        }
    }

    fn slot(&self, user: &UserAddress) -> Arc<GraphSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(user.clone()).or_default())
    }

    async fn ensure_warm(&self, user: &UserAddress) -> Result<Arc<GraphSlot>> {
        let slot = self.slot(user);
        if slot.warm.read().await.is_some() {
            return Ok(slot);
        }
        let flight_slot = Arc::clone(&slot);
        let _flight = flight_slot.load_flight.lock().await;
        if slot.warm.read().await.is_some() {
            return Ok(slot);
        }

        let (graph, checkpoint_ref) = match self.latest_checkpoint(user).await? {
            Some(address) => {
                let object = self.store.get(&address).await?;
                let graph = KnowledgeGraph::from_snapshot(&object.bytes).map_err(|reason| {
                    Error::IndexCorrupted {
                        user: user.to_string(),
                        reason: format!("graph checkpoint: {reason}"),
                    }
                })?;
                info!(user = %user, nodes = graph.node_count(), "hydrated graph checkpoint");
                (graph, Some(address))
            }
            None => {
                debug!(user = %user, "creating empty graph");
                (KnowledgeGraph::new(), None)
            }
        };

        let now = Instant::now();
        *slot.warm.write().await = Some(WarmGraph {
            graph,
            dirty: 0,
            last_used: now,
            last_mutation: now,
            checkpoint_ref,
        });
        Ok(slot)
    }

    /// Upsert an extraction into the user's graph; returns the ids of every
    /// node touched (for attaching to a memory's `graph_refs`).
    #[instrument(skip(self, extraction), fields(user = %user))]
    pub async fn add(&self, user: &UserAddress, extraction: &Extraction) -> Result<Vec<u64>> {
        if extraction.is_empty() {
            return Ok(Vec::new());
        }
        let slot = self.ensure_warm(user).await?;
        let mut guard = slot.warm.write().await;
        let Some(warm) = guard.as_mut() else {
            drop(guard);
            return Box::pin(self.add(user, extraction)).await;
        };

        let mut by_name: HashMap<String, u64> = HashMap::new();
        let mut touched = Vec::new();
        for node in &extraction.nodes {
            let id = warm
                .graph
                .upsert_node(&node.kind, &node.name, node.props.clone());
            by_name.insert(crate::graph::normalise_name(&node.name), id);
            touched.push(id);
            warm.dirty += 1;
        }
        for edge in &extraction.edges {
            let from = by_name.get(&crate::graph::normalise_name(&edge.from_name));
            let to = by_name.get(&crate::graph::normalise_name(&edge.to_name));
            let (Some(&from), Some(&to)) = (from, to) else {
                continue; // endpoint not named in this extraction
            };
            warm.graph
                .add_edge(from, to, &edge.label, edge.weight, BTreeMap::new())?;
            warm.dirty += 1;
        }
        warm.last_mutation = Instant::now();
        warm.last_used = warm.last_mutation;
        touched.sort_unstable();
        touched.dedup();
        Ok(touched)
    }

    /// Attach a standalone node (e.g. a version link) to the user's graph.
    pub async fn upsert_node(
        &self,
        user: &UserAddress,
        kind: &str,
        name: &str,
        props: BTreeMap<String, String>,
    ) -> Result<u64> {
        let slot = self.ensure_warm(user).await?;
        let mut guard = slot.warm.write().await;
        let Some(warm) = guard.as_mut() else {
            drop(guard);
            return Box::pin(self.upsert_node(user, kind, name, props)).await;
        };
        let id = warm.graph.upsert_node(kind, name, props);
        warm.dirty += 1;
        warm.last_mutation = Instant::now();
        Ok(id)
    }

    /// Bounded BFS expansion from seed node ids.
    pub async fn neighbours(
        &self,
        user: &UserAddress,
        seeds: &[u64],
        max_hops: usize,
        edge_filter: Option<&str>,
    ) -> Result<HashSet<u64>> {
        let slot = self.ensure_warm(user).await?;
        let guard = slot.warm.read().await;
        let Some(warm) = guard.as_ref() else {
            drop(guard);
            return Box::pin(self.neighbours(user, seeds, max_hops, edge_filter)).await;
        };
        Ok(warm
            .graph
            .neighbours(seeds, max_hops, self.visit_budget, edge_filter))
    }

    /// Find node ids by (normalised) name.
    pub async fn find_by_name(
        &self,
        user: &UserAddress,
        name: &str,
        kind: Option<&str>,
    ) -> Result<Vec<u64>> {
        let slot = self.ensure_warm(user).await?;
        let guard = slot.warm.read().await;
        let Some(warm) = guard.as_ref() else {
            drop(guard);
            return Box::pin(self.find_by_name(user, name, kind)).await;
        };
        Ok(warm.graph.find_by_name(name, kind))
    }

    /// Nodes plus fully-contained edges for a node id set.
    pub async fn subgraph(&self, user: &UserAddress, node_ids: &[u64]) -> Result<Subgraph> {
        let slot = self.ensure_warm(user).await?;
        let guard = slot.warm.read().await;
        let Some(warm) = guard.as_ref() else {
            drop(guard);
            return Box::pin(self.subgraph(user, node_ids)).await;
        };
        Ok(warm.graph.subgraph(node_ids))
    }

    /// Write the user's graph to a durable checkpoint. A successful return
    /// means the on-blob graph reflects every prior `add`.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn checkpoint(&self, user: &UserAddress) -> Result<Option<BlobAddress>> {
        let slot = self.ensure_warm(user).await?;
        let (bytes, captured_dirty) = {
            let guard = slot.warm.read().await;
            let Some(warm) = guard.as_ref() else {
                drop(guard);
                return Box::pin(self.checkpoint(user)).await;
            };
            if warm.dirty == 0 {
                return Ok(warm.checkpoint_ref.clone());
            }
            (warm.graph.to_snapshot()?, warm.dirty)
        };

        let mut tags = BlobTags::internal(user.as_str(), CHECKPOINT_CONTENT_TYPE);
        tags.created_ms = self.clock.now_ms();
        tags.content_size = bytes.len() as u64;

        match self.store.put(bytes, tags).await {
            Ok(receipt) => {
                let mut guard = slot.warm.write().await;
                if let Some(warm) = guard.as_mut() {
                    // Mutations racing the blob write stay dirty for the
                    // next checkpoint.
                    warm.dirty = warm.dirty.saturating_sub(captured_dirty);
                    warm.checkpoint_ref = Some(receipt.address.clone());
                }
                self.counters.lock().0 += 1;
                info!(user = %user, address = %receipt.address, "graph checkpoint written");
                Ok(Some(receipt.address))
            }
            Err(e) => {
                self.counters.lock().1 += 1;
                warn!(user = %user, error = %e, "graph checkpoint failed; will retry");
                Err(e)
            }
        }
    }

    /// Checkpoint policy tick: every N mutations, or dirty state idle for
    /// longer than the idle-flush interval.
    pub async fn maintain(&self) {
        let users: Vec<UserAddress> = self.slots.lock().keys().cloned().collect();
        for user in users {
            let slot = self.slot(&user);
            let wants_checkpoint = {
                let guard = slot.warm.read().await;
                guard.as_ref().is_some_and(|warm| {
                    warm.dirty >= self.checkpoint_every
                        || (warm.dirty > 0 && warm.last_mutation.elapsed() >= self.idle_flush)
                })
            };
            if wants_checkpoint {
                if let Err(e) = self.checkpoint(&user).await {
                    warn!(user = %user, error = %e, "maintenance checkpoint failed");
                }
            }
        }
    }

    /// Stats snapshot across users.
    pub async fn stats(&self) -> GraphManagerStats {
        let slots: Vec<(UserAddress, Arc<GraphSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(u, s)| (u.clone(), Arc::clone(s)))
            .collect();

        let mut users = Vec::with_capacity(slots.len());
        for (user, slot) in slots {
            let guard = slot.warm.read().await;
            match guard.as_ref() {
                Some(warm) => users.push(UserGraphStats {
                    user,
                    warm: true,
                    nodes: warm.graph.node_count(),
                    edges: warm.graph.edge_count(),
                    pending_checkpoint: warm.dirty,
                }),
                None => users.push(UserGraphStats {
                    user,
                    warm: false,
                    nodes: 0,
                    edges: 0,
                    pending_checkpoint: 0,
                }),
            }
        }
        let (checkpoints_written, checkpoint_failures) = *self.counters.lock();
        GraphManagerStats {
            users,
            checkpoints_written,
            checkpoint_failures,
        }
    }

    async fn latest_checkpoint(&self, user: &UserAddress) -> Result<Option<BlobAddress>> {
        let mut best: Option<(i64, BlobAddress)> = None;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .list(
                    user.as_str(),
                    Some(("content_type", CHECKPOINT_CONTENT_TYPE)),
                    64,
                    cursor.as_deref(),
                )
                .await?;
            for address in page.addresses {
                if let Some(tags) = self.store.head(&address).await? {
                    if best.as_ref().map_or(true, |(ms, _)| tags.created_ms > *ms) {
                        best = Some((tags.created_ms, address));
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(best.map(|(_, address)| address))
    }
}
