//! Graph index: the authoritative node map and edge adjacency
//!
//! Nodes live in an arena keyed by id and edges in per-node adjacency lists;
//! nothing holds a reference to another node. The PARENT subgraph is kept a
//! forest: `parent_of` is derived from PARENT edges and updated inside the
//! same write lock as the edge list, so the two views cannot diverge.
//!
//! Embeddings are mirrored into a [`VectorIndex`] together with the metadata
//! that similarity queries filter on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::{EdgeType, MemoryEdge, MemoryNode, NodeStatus, NodeType, Tier};
use crate::storage::{GraphSnapshot, VectorIndex, VectorMetadata};

#[derive(Default)]
struct GraphState {
    nodes: HashMap<Uuid, MemoryNode>,
    /// Outgoing edges keyed by `from`
    outgoing: HashMap<Uuid, Vec<MemoryEdge>>,
    /// child -> parent, projection of PARENT edges
    parent_of: HashMap<Uuid, Uuid>,
}

impl GraphState {
    fn edge_exists(&self, from: Uuid, to: Uuid, edge_type: EdgeType) -> bool {
        self.outgoing
            .get(&from)
            .map(|edges| edges.iter().any(|e| e.same_as(from, to, edge_type)))
            .unwrap_or(false)
    }

    fn children(&self, id: Uuid) -> Vec<Uuid> {
        self.outgoing
            .get(&id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.edge_type == EdgeType::Parent && self.nodes.contains_key(&e.to))
                    .map(|e| e.to)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `ancestor` is `id` or lies above it in the PARENT forest
    fn is_ancestor(&self, ancestor: Uuid, id: Uuid) -> bool {
        let mut current = Some(id);
        let mut seen = HashSet::new();
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            if !seen.insert(node) {
                return false;
            }
            current = self.parent_of.get(&node).copied();
        }
        false
    }
}

/// Activated node counts per tier
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TierSizes {
    pub working: usize,
    pub long_term: usize,
    pub user: usize,
}

impl TierSizes {
    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Working => self.working,
            Tier::LongTerm => self.long_term,
            Tier::User => self.user,
        }
    }

    fn bump(&mut self, tier: Tier) {
        match tier {
            Tier::Working => self.working += 1,
            Tier::LongTerm => self.long_term += 1,
            Tier::User => self.user += 1,
        }
    }
}

/// Result of loading a snapshot into the index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub nodes: usize,
    pub edges: usize,
    pub skipped_edges: usize,
}

/// Node map, adjacency lists and the vector mirror
pub struct GraphIndex {
    state: RwLock<GraphState>,
    sizes: RwLock<TierSizes>,
    vectors: Arc<dyn VectorIndex>,
}

impl GraphIndex {
    pub fn new(vectors: Arc<dyn VectorIndex>) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            sizes: RwLock::new(TierSizes::default()),
            vectors,
        }
    }

    /// The vector index nodes are mirrored into
    pub fn vectors(&self) -> &Arc<dyn VectorIndex> {
        &self.vectors
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Nodes ====================

    /// Insert or replace a node, then mirror it into the vector index.
    ///
    /// Nodes without an embedding are stored but not mirrored; replacing a
    /// mirrored node with one that has no embedding drops its old vector.
    pub async fn add_node(&self, node: MemoryNode) -> Result<()> {
        let mirror = node
            .embedding
            .clone()
            .map(|embedding| (embedding, VectorMetadata::of(&node)));
        let id = node.id;

        let replaced = self.write().nodes.insert(id, node);

        match mirror {
            Some((embedding, metadata)) => self.vectors.upsert(id, &embedding, metadata).await,
            None if replaced.map_or(false, |old| old.embedding.is_some()) => {
                tracing::debug!(node_id = %id, "Embedding cleared, dropping stale vector");
                self.vectors.remove(id).await
            }
            None => {
                tracing::debug!(node_id = %id, "Node stored without embedding, not mirrored");
                Ok(())
            }
        }
    }

    /// Modify a node in place under the write lock, then re-mirror it.
    ///
    /// Concurrent updates of one node are applied one after the other, so
    /// none of them is lost. Returns the updated node.
    pub async fn update_node<F>(&self, id: Uuid, update: F) -> Result<MemoryNode>
    where
        F: FnOnce(&mut MemoryNode),
    {
        let updated = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("node {}", id)))?;
            update(node);
            node.clone()
        };

        if let Some(embedding) = &updated.embedding {
            self.vectors
                .upsert(id, embedding, VectorMetadata::of(&updated))
                .await?;
        }
        Ok(updated)
    }

    pub fn get_node(&self, id: Uuid) -> Option<MemoryNode> {
        self.read().nodes.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.read().nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All nodes passing `predicate`
    pub fn nodes<F>(&self, predicate: F) -> Vec<MemoryNode>
    where
        F: Fn(&MemoryNode) -> bool,
    {
        self.read()
            .nodes
            .values()
            .filter(|n| predicate(n))
            .cloned()
            .collect()
    }

    /// Activated nodes of a tier, optionally for one owner
    pub fn active_nodes(&self, tier: Tier, owner_id: Option<&str>) -> Vec<MemoryNode> {
        self.nodes(|n| {
            n.is_active() && n.tier == tier && owner_id.map_or(true, |o| n.owner_id == o)
        })
    }

    /// Soft delete: the node stays addressable with `status=deleted`, its
    /// edges are untouched, and its mirror stops matching activated filters.
    pub async fn delete_node(&self, id: Uuid) -> Result<()> {
        self.set_status(id, NodeStatus::Deleted).await
    }

    /// Change a node's status and re-mirror its metadata
    pub async fn set_status(&self, id: Uuid, status: NodeStatus) -> Result<()> {
        let mirror = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("node {}", id)))?;
            node.status = status;
            node.updated_at = Utc::now();
            node.embedding
                .clone()
                .map(|embedding| (embedding, VectorMetadata::of(node)))
        };

        if let Some((embedding, metadata)) = mirror {
            self.vectors.upsert(id, &embedding, metadata).await?;
        }
        Ok(())
    }

    // ==================== Edges ====================

    /// Insert an edge.
    ///
    /// Returns `Ok(false)` if an identical `(from, to, type)` edge exists.
    /// A PARENT edge re-parents a child that already has a parent, and is
    /// rejected if it would close a cycle.
    pub fn add_edge(&self, edge: MemoryEdge) -> Result<bool> {
        let mut state = self.write();

        if !state.nodes.contains_key(&edge.from) || !state.nodes.contains_key(&edge.to) {
            return Err(Error::integrity(format!(
                "{} edge {} -> {} has a missing endpoint",
                edge.edge_type, edge.from, edge.to
            )));
        }
        if state.edge_exists(edge.from, edge.to, edge.edge_type) {
            return Ok(false);
        }

        if edge.edge_type == EdgeType::Parent {
            if state.is_ancestor(edge.to, edge.from) {
                return Err(Error::integrity(format!(
                    "PARENT edge {} -> {} would create a cycle",
                    edge.from, edge.to
                )));
            }
            if let Some(old_parent) = state.parent_of.insert(edge.to, edge.from) {
                if let Some(edges) = state.outgoing.get_mut(&old_parent) {
                    edges.retain(|e| !e.same_as(old_parent, edge.to, EdgeType::Parent));
                }
                tracing::debug!(child = %edge.to, from = %old_parent, to = %edge.from, "Re-parented node");
            }
        }

        state.outgoing.entry(edge.from).or_default().push(edge);
        Ok(true)
    }

    pub fn edge_exists(&self, from: Uuid, to: Uuid, edge_type: EdgeType) -> bool {
        self.read().edge_exists(from, to, edge_type)
    }

    /// Outgoing edges of a node
    pub fn edges_of(&self, id: Uuid) -> Vec<MemoryEdge> {
        self.read().outgoing.get(&id).cloned().unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.read().outgoing.values().map(Vec::len).sum()
    }

    /// Children in the hierarchy: targets of PARENT edges that still exist
    pub fn children_ids(&self, id: Uuid) -> Vec<Uuid> {
        self.read().children(id)
    }

    /// Targets of every outgoing edge that still exist, whatever the type
    pub fn successors(&self, id: Uuid) -> Vec<Uuid> {
        let state = self.read();
        state
            .outgoing
            .get(&id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| state.nodes.contains_key(&e.to))
                    .map(|e| e.to)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parent_of(&self, id: Uuid) -> Option<Uuid> {
        self.read().parent_of.get(&id).copied()
    }

    /// Sources of every edge pointing at `id`, any type
    pub fn parents(&self, id: Uuid) -> Vec<Uuid> {
        let state = self.read();
        let mut out = Vec::new();
        for edges in state.outgoing.values() {
            for edge in edges {
                if edge.to == id && !out.contains(&edge.from) {
                    out.push(edge.from);
                }
            }
        }
        out
    }

    /// Check that `parent_of` equals the projection of PARENT edges and
    /// that the PARENT subgraph is a forest
    pub fn verify_hierarchy(&self) -> Result<()> {
        let state = self.read();
        let mut projected: HashMap<Uuid, Uuid> = HashMap::new();

        for edges in state.outgoing.values() {
            for edge in edges.iter().filter(|e| e.edge_type == EdgeType::Parent) {
                if let Some(other) = projected.insert(edge.to, edge.from) {
                    return Err(Error::integrity(format!(
                        "node {} has two parents: {} and {}",
                        edge.to, other, edge.from
                    )));
                }
            }
        }
        if projected != state.parent_of {
            return Err(Error::integrity(
                "parent cache does not match PARENT edges",
            ));
        }
        for &child in projected.keys() {
            let mut seen = HashSet::new();
            let mut current = Some(child);
            while let Some(node) = current {
                if !seen.insert(node) {
                    return Err(Error::integrity(format!("PARENT cycle through {}", child)));
                }
                current = projected.get(&node).copied();
            }
        }
        Ok(())
    }

    // ==================== Queries ====================

    /// Activated, non-Working, non-reasoning nodes sharing at least
    /// `min_overlap` tags with `tags`.
    ///
    /// Ranked by overlap, then by how many tags the node has, then recency.
    pub fn neighbors_by_tag(
        &self,
        tags: &[String],
        exclude_ids: &HashSet<Uuid>,
        owner_id: Option<&str>,
        top_k: usize,
        min_overlap: usize,
    ) -> Vec<MemoryNode> {
        let query: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let state = self.read();

        let mut scored: Vec<(usize, &MemoryNode)> = state
            .nodes
            .values()
            .filter(|n| {
                n.is_active()
                    && n.tier != Tier::Working
                    && n.node_type != NodeType::Reasoning
                    && !exclude_ids.contains(&n.id)
                    && owner_id.map_or(true, |o| n.owner_id == o)
            })
            .map(|n| (n.tag_overlap(&query), n))
            .filter(|(overlap, _)| *overlap >= min_overlap)
            .collect();

        scored.sort_by(|(oa, a), (ob, b)| {
            ob.cmp(oa)
                .then_with(|| b.tags.len().cmp(&a.tags.len()))
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });

        scored
            .into_iter()
            .take(top_k)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Recount activated nodes per tier and cache the result
    pub fn refresh_sizes(&self) -> TierSizes {
        let mut sizes = TierSizes::default();
        for node in self.read().nodes.values().filter(|n| n.is_active()) {
            sizes.bump(node.tier);
        }
        *self.sizes.write().unwrap_or_else(|e| e.into_inner()) = sizes.clone();
        sizes
    }

    /// Sizes as of the last `refresh_sizes`
    pub fn sizes(&self) -> TierSizes {
        self.sizes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ==================== Rendering ====================

    /// Render a readable outline of the graph.
    ///
    /// Works over `ids` (or every node), keeping activated non-Working nodes
    /// of `owner_id`. Local roots (no PARENT inside that set) are listed most
    /// recent first, each followed by its subtree. `detail` adds metadata
    /// lines under leaves.
    pub fn render(
        &self,
        ids: Option<&[Uuid]>,
        owner_id: Option<&str>,
        detail: bool,
        top_k: Option<usize>,
    ) -> String {
        let state = self.read();
        let keep = |n: &MemoryNode| {
            n.is_active() && n.tier != Tier::Working && owner_id.map_or(true, |o| n.owner_id == o)
        };

        let selected: Vec<&MemoryNode> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.nodes.get(id))
                .filter(|n| keep(n))
                .collect(),
            None => state.nodes.values().filter(|n| keep(n)).collect(),
        };
        let selected_ids: HashSet<Uuid> = selected.iter().map(|n| n.id).collect();

        let mut roots: Vec<&MemoryNode> = selected
            .into_iter()
            .filter(|n| {
                state
                    .parent_of
                    .get(&n.id)
                    .map_or(true, |p| !selected_ids.contains(p))
            })
            .collect();
        roots.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        roots.dedup_by_key(|n| n.id);
        if let Some(k) = top_k {
            roots.truncate(k);
        }

        let mut out = String::new();
        let mut visited = HashSet::new();
        for root in roots {
            render_subtree(&state, root, 0, detail, &keep, &mut visited, &mut out);
        }
        out
    }

    // ==================== Snapshots ====================

    /// Every node of `owner_id` and every edge leaving one of them
    pub fn snapshot(&self, owner_id: &str) -> GraphSnapshot {
        let state = self.read();
        let nodes: Vec<MemoryNode> = state
            .nodes
            .values()
            .filter(|n| n.owner_id == owner_id)
            .cloned()
            .collect();
        let edges: Vec<MemoryEdge> = nodes
            .iter()
            .filter_map(|n| state.outgoing.get(&n.id))
            .flatten()
            .cloned()
            .collect();
        GraphSnapshot::new(owner_id, nodes, edges)
    }

    /// Load a snapshot: nodes first (mirrored), then edges.
    ///
    /// Edges whose endpoints are missing are skipped and counted.
    pub async fn restore(&self, snapshot: GraphSnapshot) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();
        for node in snapshot.nodes {
            self.add_node(node).await?;
            summary.nodes += 1;
        }
        for edge in snapshot.edges {
            match self.add_edge(edge) {
                Ok(true) => summary.edges += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping edge while restoring snapshot");
                    summary.skipped_edges += 1;
                }
            }
        }
        Ok(summary)
    }
}

fn render_subtree<F>(
    state: &GraphState,
    node: &MemoryNode,
    depth: usize,
    detail: bool,
    keep: &F,
    visited: &mut HashSet<Uuid>,
    out: &mut String,
) where
    F: Fn(&MemoryNode) -> bool,
{
    if !visited.insert(node.id) {
        return;
    }
    let indent = "  ".repeat(depth);
    out.push_str(&format!(
        "{}- [{}] {}: {}\n",
        indent,
        node.node_type,
        node.title(),
        node.content
    ));

    let children: Vec<&MemoryNode> = state
        .children(node.id)
        .iter()
        .filter_map(|id| state.nodes.get(id))
        .filter(|n| keep(n))
        .collect();

    if children.is_empty() {
        if detail {
            render_detail(state, node, &indent, out);
        }
        return;
    }
    for child in children {
        render_subtree(state, child, depth + 1, detail, keep, visited, out);
    }
}

fn render_detail(state: &GraphState, node: &MemoryNode, indent: &str, out: &mut String) {
    out.push_str(&format!(
        "{}  status: {} | type: {} | tier: {}\n",
        indent, node.status, node.node_type, node.tier
    ));
    if !node.tags.is_empty() {
        out.push_str(&format!("{}  tags: {}\n", indent, node.tags.join(", ")));
    }
    if !node.sources.is_empty() {
        let sources: Vec<String> = node.sources.iter().map(Uuid::to_string).collect();
        out.push_str(&format!("{}  sources: {}\n", indent, sources.join(", ")));
    }
    if let Some(background) = node.background.as_deref().filter(|b| !b.is_empty()) {
        out.push_str(&format!("{}  background: {}\n", indent, background));
    }

    let relations: Vec<String> = state
        .outgoing
        .get(&node.id)
        .into_iter()
        .flatten()
        .filter(|e| e.edge_type != EdgeType::Parent)
        .filter_map(|e| {
            state
                .nodes
                .get(&e.to)
                .filter(|target| target.is_active())
                .map(|target| format!("{} -> {}", e.edge_type, target.title()))
        })
        .collect();
    if !relations.is_empty() {
        out.push_str(&format!("{}  relations: {}\n", indent, relations.join("; ")));
    }
}
