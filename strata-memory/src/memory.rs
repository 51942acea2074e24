//! Tiered memory manager: the write path, capacity policy and snapshots

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{Config, SnapshotBackend, VectorBackend};
use crate::embedding::{Embedder, FastEmbedder};
use crate::error::Result;
use crate::graph::{GraphIndex, RestoreSummary, TierSizes};
use crate::node::{MemoryNode, NodeStatus, Tier};
use crate::storage::{
    InMemoryVectorIndex, JsonlSnapshotStore, LanceVectorIndex, SnapshotStore,
    SqliteSnapshotStore, VectorFilter, VectorIndex,
};

/// One gate per tier. Writers share it; a reorganizer pass takes it
/// exclusively for its whole duration.
#[derive(Default)]
pub struct TierGates {
    working: RwLock<()>,
    long_term: RwLock<()>,
    user: RwLock<()>,
}

impl TierGates {
    pub fn get(&self, tier: Tier) -> &RwLock<()> {
        match tier {
            Tier::Working => &self.working,
            Tier::LongTerm => &self.long_term,
            Tier::User => &self.user,
        }
    }
}

/// What happened to a memory in graph ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "id", rename_all = "lowercase")]
pub enum Ingested {
    Inserted(Uuid),
    /// Folded into this existing node
    Merged(Uuid),
}

/// Result of adding one memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    /// The Working-tier shadow copy
    pub working_id: Uuid,
    /// `None` for memories that only belong in the Working tier
    pub ingested: Option<Ingested>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub sizes: TierSizes,
    pub capacities: TierSizes,
    pub nodes: usize,
    pub edges: usize,
}

/// Coordinates the graph index, the embedder and the snapshot store
pub struct TieredMemory {
    config: Config,
    graph: Arc<GraphIndex>,
    embedder: Arc<dyn Embedder>,
    snapshots: Arc<dyn SnapshotStore>,
    gates: Arc<TierGates>,
}

impl TieredMemory {
    /// Open the backends selected in `config`
    pub async fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;

        let vectors: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::InMemory => Arc::new(InMemoryVectorIndex::new()),
            VectorBackend::Lance => Arc::new(LanceVectorIndex::new(&config).await?),
        };
        let snapshots: Arc<dyn SnapshotStore> = match config.snapshot_backend {
            SnapshotBackend::Sqlite => Arc::new(SqliteSnapshotStore::new(&config)?),
            SnapshotBackend::Jsonl => Arc::new(JsonlSnapshotStore::new(&config)?),
        };
        let embedder = Arc::new(FastEmbedder::new(&config)?);

        Ok(Self::new(
            config,
            Arc::new(GraphIndex::new(vectors)),
            embedder,
            snapshots,
        ))
    }

    pub fn new(
        config: Config,
        graph: Arc<GraphIndex>,
        embedder: Arc<dyn Embedder>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            graph,
            embedder,
            snapshots,
            gates: Arc::new(TierGates::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &Arc<GraphIndex> {
        &self.graph
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Tier gates, shared with the reorganizer
    pub fn gates(&self) -> &Arc<TierGates> {
        &self.gates
    }

    // ==================== Write path ====================

    /// Add a batch of memories.
    ///
    /// Each memory first gets a Working-tier shadow copy. LongTerm and User
    /// memories are then merged into a near-duplicate or inserted. The
    /// Working capacity policy runs once the batch is in.
    pub async fn add(&self, memories: Vec<MemoryNode>) -> Result<Vec<AddOutcome>> {
        let mut outcomes = Vec::with_capacity(memories.len());

        for memory in memories {
            let working_id = self.write_shadow(&memory).await?;
            let ingested = if memory.tier.is_graph_tier() {
                Some(self.ingest(memory).await?)
            } else {
                None
            };
            outcomes.push(AddOutcome {
                working_id,
                ingested,
            });
        }

        self.enforce_capacity().await?;
        Ok(outcomes)
    }

    async fn write_shadow(&self, memory: &MemoryNode) -> Result<Uuid> {
        let now = Utc::now();
        let mut shadow = memory.clone();
        shadow.id = Uuid::new_v4();
        shadow.tier = Tier::Working;
        shadow.status = NodeStatus::Activated;
        shadow.sources = vec![memory.id];
        shadow.history.clear();
        shadow.created_at = now;
        shadow.updated_at = now;
        let id = shadow.id;

        let _gate = self.gates.get(Tier::Working).read().await;
        self.graph.add_node(shadow).await?;
        Ok(id)
    }

    async fn ingest(&self, mut node: MemoryNode) -> Result<Ingested> {
        let _gate = self.gates.get(node.tier).read().await;

        let embedding = match node.embedding.take() {
            Some(embedding) => embedding,
            None => self.embedder.embed(&node.embedding_text()).await?,
        };
        node.status = NodeStatus::Activated;

        let filter = VectorFilter::new()
            .owner(&node.owner_id)
            .activated()
            .tiers(&[node.tier]);
        let hits = self
            .graph
            .vectors()
            .query(&embedding, self.config.merge_candidates, &filter)
            .await?;

        let best = hits
            .into_iter()
            .filter(|hit| hit.id != node.id && hit.score >= self.config.similar_threshold)
            .find(|hit| self.graph.get_node(hit.id).map_or(false, |n| n.is_active()));

        node.embedding = Some(embedding);
        match best {
            Some(hit) if hit.score >= self.config.merge_threshold => {
                tracing::debug!(incoming = %node.id, existing = %hit.id, score = hit.score, "Merging memory");
                self.merge_into(hit.id, node).await?;
                Ok(Ingested::Merged(hit.id))
            }
            _ => {
                let id = node.id;
                self.graph.add_node(node).await?;
                Ok(Ingested::Inserted(id))
            }
        }
    }

    /// Fold `incoming` into the node `existing_id`, keeping its id.
    ///
    /// The combine step runs under the graph lock. The new embedding is only
    /// stored if no later merge changed the text in the meantime.
    async fn merge_into(&self, existing_id: Uuid, incoming: MemoryNode) -> Result<()> {
        let merged = self
            .graph
            .update_node(existing_id, |existing| combine(existing, incoming))
            .await?;

        let text = merged.embedding_text();
        let embedding = self.embedder.embed(&text).await?;
        self.graph
            .update_node(existing_id, |node| {
                if node.embedding_text() == text {
                    node.embedding = Some(embedding);
                }
            })
            .await?;
        Ok(())
    }

    /// Apply tier capacities.
    ///
    /// `working_capacity` applies per owner: each owner's oldest activated
    /// Working nodes beyond it are archived. LongTerm and User overflow is
    /// only reported; consolidation handles it.
    pub async fn enforce_capacity(&self) -> Result<Vec<Uuid>> {
        let mut by_owner: HashMap<String, Vec<MemoryNode>> = HashMap::new();
        for node in self.graph.active_nodes(Tier::Working, None) {
            by_owner.entry(node.owner_id.clone()).or_default().push(node);
        }

        let mut archived = Vec::new();
        for (owner_id, mut working) in by_owner {
            if working.len() <= self.config.working_capacity {
                continue;
            }
            working.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            let excess = working.len() - self.config.working_capacity;
            for node in working.into_iter().take(excess) {
                self.graph.set_status(node.id, NodeStatus::Archived).await?;
                archived.push(node.id);
            }
            tracing::debug!(owner_id = %owner_id, excess, "Archived oldest Working nodes");
        }

        let sizes = self.graph.refresh_sizes();
        for tier in [Tier::LongTerm, Tier::User] {
            let capacity = self.config.capacity(tier);
            if sizes.get(tier) > capacity {
                tracing::warn!(%tier, size = sizes.get(tier), capacity, "Tier over capacity");
            }
        }
        Ok(archived)
    }

    /// Soft-delete a node
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.graph.delete_node(id).await
    }

    pub fn get(&self, id: Uuid) -> Option<MemoryNode> {
        self.graph.get_node(id)
    }

    // ==================== Snapshots ====================

    /// Persist every node and edge of `owner_id`
    pub fn save(&self, owner_id: &str) -> Result<()> {
        let snapshot = self.graph.snapshot(owner_id);
        tracing::info!(
            owner_id,
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "Saving graph snapshot"
        );
        self.snapshots.save(&snapshot)
    }

    /// Load the saved graph of `owner_id`; `None` if nothing was saved
    pub async fn load(&self, owner_id: &str) -> Result<Option<RestoreSummary>> {
        let Some(snapshot) = self.snapshots.load(owner_id)? else {
            return Ok(None);
        };
        let summary = self.graph.restore(snapshot).await?;
        self.graph.refresh_sizes();
        tracing::info!(
            owner_id,
            nodes = summary.nodes,
            edges = summary.edges,
            skipped = summary.skipped_edges,
            "Loaded graph snapshot"
        );
        Ok(Some(summary))
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            sizes: self.graph.refresh_sizes(),
            capacities: TierSizes {
                working: self.config.working_capacity,
                long_term: self.config.long_term_capacity,
                user: self.config.user_capacity,
            },
            nodes: self.graph.len(),
            edges: self.graph.edge_count(),
        }
    }
}

/// Combine `incoming` into `existing`: content, tags, sources, background
fn combine(existing: &mut MemoryNode, incoming: MemoryNode) {
    let content = incoming.content.trim();
    if !content.is_empty() && !existing.content.contains(content) {
        existing.history.push(existing.content.clone());
        existing.content = format!("{}\n{}", existing.content, content);
    }
    for tag in incoming.tags {
        existing.add_tag(tag);
    }
    for source in incoming.sources.into_iter().chain(std::iter::once(incoming.id)) {
        if !existing.sources.contains(&source) {
            existing.sources.push(source);
        }
    }
    if let Some(background) = incoming.background.filter(|b| !b.trim().is_empty()) {
        existing.background = match existing.background.take() {
            Some(current) if current.contains(&background) => Some(current),
            Some(current) if !current.is_empty() => Some(format!("{}\n{}", current, background)),
            _ => Some(background),
        };
    }
    if existing.key.is_none() {
        existing.key = incoming.key;
    }
    existing.updated_at = Utc::now();
}
