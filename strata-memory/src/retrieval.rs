//! Context retrieval: similarity hits expanded through the hierarchy and
//! rendered as text for prompt injection

use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use crate::embedding::TokenCounter;
use crate::error::Result;
use crate::graph::GraphIndex;
use crate::memory::TieredMemory;
use crate::node::Tier;
use crate::storage::{SearchResult, VectorFilter};

/// Retrieved context ready for injection into prompts
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalContext {
    /// Direct similarity hits, best first
    pub hits: Vec<RetrievedNode>,

    /// Hits plus every descendant reached by expansion
    pub node_ids: Vec<Uuid>,

    /// Detail-mode rendering of `node_ids`
    pub text: String,

    /// Rough token count of `text`
    pub total_tokens: u32,
}

impl RetrievalContext {
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            node_ids: Vec::new(),
            text: String::new(),
            total_tokens: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// Format the context for injection into a prompt
    pub fn format_for_prompt(&self) -> String {
        if self.text.is_empty() {
            return String::new();
        }
        format!("## Relevant Memories\n{}", self.text)
    }
}

/// A node that was retrieved with its relevance score
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedNode {
    pub id: Uuid,
    pub score: f32,
    pub tier: Tier,
}

impl From<SearchResult> for RetrievedNode {
    fn from(result: SearchResult) -> Self {
        Self {
            id: result.id,
            score: result.score,
            tier: result.metadata.tier,
        }
    }
}

impl TieredMemory {
    /// Search `owner_id`'s LongTerm and User memories for `query`.
    ///
    /// The `top_k` best activated hits are expanded through their PARENT
    /// descendants, at most `max_expand_depth` levels deep, and the whole
    /// set is rendered in detail mode.
    pub async fn search(&self, query: &str, top_k: usize, owner_id: &str) -> Result<RetrievalContext> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(RetrievalContext::empty());
        }

        let embedding = self.embedder().embed(query).await?;
        let filter = VectorFilter::new()
            .owner(owner_id)
            .activated()
            .tiers(&[Tier::LongTerm, Tier::User]);
        let hits = self
            .graph()
            .vectors()
            .query(&embedding, top_k, &filter)
            .await?;

        let hits: Vec<RetrievedNode> = hits
            .into_iter()
            .filter(|hit| self.graph().get_node(hit.id).map_or(false, |n| n.is_active()))
            .map(RetrievedNode::from)
            .collect();
        let roots: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let node_ids = expand(self.graph(), &roots, self.config().max_expand_depth);

        let text = self.graph().render(Some(&node_ids), Some(owner_id), true, None);
        let total_tokens = TokenCounter::estimate(&text);
        tracing::debug!(
            owner_id,
            hits = hits.len(),
            nodes = node_ids.len(),
            total_tokens,
            "Search complete"
        );

        Ok(RetrievalContext {
            hits,
            node_ids,
            text,
            total_tokens,
        })
    }
}

/// Breadth-first walk down PARENT edges from `roots`, `max_depth` levels at most
fn expand(graph: &GraphIndex, roots: &[Uuid], max_depth: usize) -> Vec<Uuid> {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut order = Vec::new();
    let mut frontier: Vec<Uuid> = Vec::new();

    for &id in roots {
        if visited.insert(id) {
            order.push(id);
            frontier.push(id);
        }
    }

    for _ in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for id in frontier {
            for child in graph.children_ids(id) {
                if visited.insert(child) {
                    order.push(child);
                    next.push(child);
                }
            }
        }
        frontier = next;
    }

    order
}
