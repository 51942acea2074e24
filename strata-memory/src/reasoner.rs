//! Relation reasoner: relations, inferences, sequence links and aggregates
//! discovered among tag-similar nodes.
//!
//! [`RelationReasoner::process`] only proposes; nothing touches the graph
//! until [`RelationReasoner::apply`] persists the proposal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::graph::GraphIndex;
use crate::node::{EdgeType, MemoryEdge, MemoryNode, NodeType, Tier};
use crate::oracle::{consult, SemanticOracle};

/// Neighbors must share at least this many tags with the node
const MIN_TAG_OVERLAP: usize = 2;

/// Neighbor count at which an aggregate concept is proposed
const AGGREGATE_MIN_NEIGHBORS: usize = 3;

/// Everything one `process` call proposes
#[derive(Debug, Clone, Default)]
pub struct Reasoning {
    /// CAUSE / CONDITION / RELATE_TO / CONFLICT edges
    pub relation_edges: Vec<MemoryEdge>,
    /// FOLLOWS edges, earlier node to later node
    pub sequence_edges: Vec<MemoryEdge>,
    /// New reasoning nodes, each with the INFERS edges pointing at it
    pub inferred: Vec<(MemoryNode, Vec<MemoryEdge>)>,
    /// Aggregate node and its AGGREGATES edges
    pub aggregate: Option<(MemoryNode, Vec<MemoryEdge>)>,
}

impl Reasoning {
    pub fn is_empty(&self) -> bool {
        self.relation_edges.is_empty()
            && self.sequence_edges.is_empty()
            && self.inferred.is_empty()
            && self.aggregate.is_none()
    }
}

/// What `apply` actually wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedReasoning {
    pub relation_edges: usize,
    pub sequence_edges: usize,
    pub inferred_nodes: usize,
    pub aggregate_nodes: usize,
}

pub struct RelationReasoner {
    graph: Arc<GraphIndex>,
    oracle: Arc<dyn SemanticOracle>,
    embedder: Arc<dyn Embedder>,
    oracle_timeout: Duration,
}

impl RelationReasoner {
    pub fn new(
        graph: Arc<GraphIndex>,
        oracle: Arc<dyn SemanticOracle>,
        embedder: Arc<dyn Embedder>,
        oracle_timeout: Duration,
    ) -> Self {
        Self {
            graph,
            oracle,
            embedder,
            oracle_timeout,
        }
    }

    /// Reason about `node` against up to `top_k` tag neighbors.
    ///
    /// Oracle failures only drop the affected decision. An oracle timeout
    /// is returned as an error.
    pub async fn process(
        &self,
        node: &MemoryNode,
        exclude_ids: &HashSet<Uuid>,
        top_k: usize,
    ) -> Result<Reasoning> {
        let mut out = Reasoning::default();
        if node.node_type == NodeType::Reasoning {
            return Ok(out);
        }

        let mut exclude = exclude_ids.clone();
        exclude.insert(node.id);
        let neighbors = self.graph.neighbors_by_tag(
            &node.tags,
            &exclude,
            Some(&node.owner_id),
            top_k,
            MIN_TAG_OVERLAP,
        );
        if neighbors.is_empty() {
            return Ok(out);
        }
        tracing::debug!(node_id = %node.id, neighbors = neighbors.len(), "Reasoning over tag neighbors");

        for neighbor in &neighbors {
            let relation = consult(
                self.oracle_timeout,
                "classify_relation",
                self.oracle.classify_relation(node, neighbor),
            )
            .await?;

            if let Some((kind, edge_type)) =
                relation.and_then(|kind| kind.edge_type().map(|e| (kind, e)))
            {
                out.relation_edges
                    .push(MemoryEdge::new(node.id, neighbor.id, edge_type));

                if kind.supports_inference() {
                    let statement = consult(
                        self.oracle_timeout,
                        "derive_inference",
                        self.oracle.derive_inference(node, neighbor, edge_type),
                    )
                    .await?
                    .flatten();
                    if let Some(statement) = statement {
                        out.inferred.push(inferred_node(node, neighbor, edge_type, statement));
                    }
                }
            }

            if let Some(edge) = sequence_edge(node, neighbor) {
                out.sequence_edges.push(edge);
            }
        }

        if neighbors.len() >= AGGREGATE_MIN_NEIGHBORS {
            let mut group = Vec::with_capacity(neighbors.len() + 1);
            group.push(node.clone());
            group.extend(neighbors.iter().cloned());

            let draft = consult(
                self.oracle_timeout,
                "propose_aggregate",
                self.oracle.propose_aggregate(&group),
            )
            .await?
            .flatten();

            if let Some(draft) = draft {
                let sources: Vec<Uuid> = group.iter().map(|n| n.id).collect();
                let mut aggregate = MemoryNode::new(
                    node.owner_id.clone(),
                    node.tier,
                    NodeType::Reasoning,
                    draft.value,
                )
                .with_key(draft.key)
                .with_tags(draft.tags)
                .with_sources(sources.clone());
                if !draft.background.is_empty() {
                    aggregate.background = Some(draft.background);
                }
                aggregate.session_id = node.session_id.clone();

                let edges = sources
                    .iter()
                    .map(|&id| MemoryEdge::new(aggregate.id, id, EdgeType::Aggregates))
                    .collect();
                out.aggregate = Some((aggregate, edges));
            }
        }

        Ok(out)
    }

    /// Persist a proposal. Edges that already exist are skipped, as are
    /// edges whose endpoints vanished in the meantime.
    pub async fn apply(&self, reasoning: Reasoning) -> Result<AppliedReasoning> {
        let mut applied = AppliedReasoning::default();

        for (node, edges) in reasoning.inferred {
            self.store_derived(node).await?;
            self.link_all(&edges);
            applied.inferred_nodes += 1;
        }
        if let Some((node, edges)) = reasoning.aggregate {
            self.store_derived(node).await?;
            self.link_all(&edges);
            applied.aggregate_nodes += 1;
        }
        applied.relation_edges = self.link_all(&reasoning.relation_edges);
        applied.sequence_edges = self.link_all(&reasoning.sequence_edges);

        Ok(applied)
    }

    async fn store_derived(&self, mut node: MemoryNode) -> Result<()> {
        match self.embedder.embed(&node.embedding_text()).await {
            Ok(embedding) => node.embedding = Some(embedding),
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, "Storing derived node without embedding")
            }
        }
        self.graph.add_node(node).await
    }

    fn link_all(&self, edges: &[MemoryEdge]) -> usize {
        let mut linked = 0;
        for edge in edges {
            if self.graph.edge_exists(edge.from, edge.to, edge.edge_type) {
                continue;
            }
            match self.graph.add_edge(edge.clone()) {
                Ok(true) => linked += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping derived edge"),
            }
        }
        linked
    }
}

fn inferred_node(
    source: &MemoryNode,
    target: &MemoryNode,
    relation: EdgeType,
    statement: String,
) -> (MemoryNode, Vec<MemoryEdge>) {
    let mut node = MemoryNode::new(
        source.owner_id.clone(),
        Tier::LongTerm,
        NodeType::Reasoning,
        statement,
    )
    .with_tags(["inferred"])
    .with_sources(vec![source.id, target.id])
    .with_background(format!(
        "Inferred from \"{}\" {} \"{}\"",
        source.title(),
        relation,
        target.title()
    ));
    node.session_id = source.session_id.clone();

    let edges = node
        .sources
        .iter()
        .map(|&id| MemoryEdge::new(id, node.id, EdgeType::Infers))
        .collect();
    (node, edges)
}

/// FOLLOWS from the earlier node to the later one; none on a tie
fn sequence_edge(a: &MemoryNode, b: &MemoryNode) -> Option<MemoryEdge> {
    match a.updated_at.cmp(&b.updated_at) {
        std::cmp::Ordering::Less => Some(MemoryEdge::new(a.id, b.id, EdgeType::Follows)),
        std::cmp::Ordering::Greater => Some(MemoryEdge::new(b.id, a.id, EdgeType::Follows)),
        std::cmp::Ordering::Equal => None,
    }
}
