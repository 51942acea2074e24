//! Node and edge types for the memory graph

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Retention class of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Short-horizon raw log of everything written
    Working,

    /// Consolidated knowledge about the world
    LongTerm,

    /// Knowledge about the user
    User,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Working, Tier::LongTerm, Tier::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Working => "working",
            Tier::LongTerm => "long_term",
            Tier::User => "user",
        }
    }

    /// Tiers that take part in graph ingestion and retrieval
    pub fn is_graph_tier(&self) -> bool {
        matches!(self, Tier::LongTerm | Tier::User)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Tier::Working),
            "long_term" => Ok(Tier::LongTerm),
            "user" => Ok(Tier::User),
            _ => Err(Error::invalid_input(format!("Unknown tier: {}", s))),
        }
    }
}

/// Lifecycle state of a node. Nodes are never removed, only marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Activated,
    Archived,
    Deleted,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Activated => "activated",
            NodeStatus::Archived => "archived",
            NodeStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activated" => Ok(NodeStatus::Activated),
            "archived" => Ok(NodeStatus::Archived),
            "deleted" => Ok(NodeStatus::Deleted),
            _ => Err(Error::invalid_input(format!("Unknown status: {}", s))),
        }
    }
}

/// Kind of statement a node holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Fact,
    Event,
    Opinion,
    Preference,
    Procedure,
    /// Summary created by consolidation
    Topic,
    /// Derived by the relation reasoner; never re-derived
    Reasoning,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Fact => "fact",
            NodeType::Event => "event",
            NodeType::Opinion => "opinion",
            NodeType::Preference => "preference",
            NodeType::Procedure => "procedure",
            NodeType::Topic => "topic",
            NodeType::Reasoning => "reasoning",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(NodeType::Fact),
            "event" => Ok(NodeType::Event),
            "opinion" => Ok(NodeType::Opinion),
            "preference" => Ok(NodeType::Preference),
            "procedure" => Ok(NodeType::Procedure),
            "topic" => Ok(NodeType::Topic),
            "reasoning" => Ok(NodeType::Reasoning),
            _ => Err(Error::invalid_input(format!("Unknown node type: {}", s))),
        }
    }
}

/// Edge label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    /// Hierarchy: summary node to member
    Parent,
    Cause,
    Condition,
    RelateTo,
    Conflict,
    /// Source statement to an inferred statement
    Infers,
    /// Earlier statement to a later one
    Follows,
    /// Aggregate concept to a contributing node
    Aggregates,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Parent => "PARENT",
            EdgeType::Cause => "CAUSE",
            EdgeType::Condition => "CONDITION",
            EdgeType::RelateTo => "RELATE_TO",
            EdgeType::Conflict => "CONFLICT",
            EdgeType::Infers => "INFERS",
            EdgeType::Follows => "FOLLOWS",
            EdgeType::Aggregates => "AGGREGATES",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PARENT" => Ok(EdgeType::Parent),
            "CAUSE" => Ok(EdgeType::Cause),
            "CONDITION" => Ok(EdgeType::Condition),
            "RELATE_TO" => Ok(EdgeType::RelateTo),
            "CONFLICT" => Ok(EdgeType::Conflict),
            "INFERS" => Ok(EdgeType::Infers),
            "FOLLOWS" => Ok(EdgeType::Follows),
            "AGGREGATES" => Ok(EdgeType::Aggregates),
            _ => Err(Error::invalid_input(format!("Unknown edge type: {}", s))),
        }
    }
}

/// A single statement in the memory graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
    /// Unique, stable node ID
    pub id: Uuid,

    /// The statement itself
    pub content: String,

    pub tier: Tier,

    #[serde(default = "default_status")]
    pub status: NodeStatus,

    pub node_type: NodeType,

    /// Short title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Tags in the order they were assigned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Embedding vector (populated after embedding)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Provenance or context for the statement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,

    /// Nodes this one was derived or summarized from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Uuid>,

    /// Earlier versions of `content` replaced by merges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<String>,

    pub owner_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

fn default_status() -> NodeStatus {
    NodeStatus::Activated
}

impl MemoryNode {
    /// Create a new activated node
    pub fn new(
        owner_id: impl Into<String>,
        tier: Tier,
        node_type: NodeType,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            tier,
            status: NodeStatus::Activated,
            node_type,
            key: None,
            tags: Vec::new(),
            embedding: None,
            background: None,
            sources: Vec::new(),
            history: Vec::new(),
            owner_id: owner_id.into(),
            session_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set tags, dropping blanks and repeats but keeping first-seen order
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.clear();
        for tag in tags {
            self.add_tag(tag);
        }
        self
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    pub fn with_sources(mut self, sources: Vec<Uuid>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Activated
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        let tag = tag.trim();
        if !tag.is_empty() && !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Number of distinct tags shared with `tags`
    pub fn tag_overlap(&self, tags: &HashSet<&str>) -> usize {
        self.tags.iter().filter(|t| tags.contains(t.as_str())).count()
    }

    /// The key, or the beginning of the content when no key is set
    pub fn title(&self) -> String {
        match &self.key {
            Some(key) if !key.trim().is_empty() => key.clone(),
            _ => self.content.chars().take(48).collect(),
        }
    }

    /// Text used to compute the embedding
    pub fn embedding_text(&self) -> String {
        match &self.key {
            Some(key) => format!("{}: {}", key, self.content),
            None => self.content.clone(),
        }
    }
}

/// A directed, typed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub id: Uuid,

    pub from: Uuid,

    pub to: Uuid,

    pub edge_type: EdgeType,

    /// Usage counter
    #[serde(default)]
    pub weight: u32,

    pub created_at: DateTime<Utc>,
}

impl MemoryEdge {
    pub fn new(from: Uuid, to: Uuid, edge_type: EdgeType) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            edge_type,
            weight: 0,
            created_at: Utc::now(),
        }
    }

    pub fn parent(parent: Uuid, child: Uuid) -> Self {
        Self::new(parent, child, EdgeType::Parent)
    }

    /// Whether this edge is the same relation as `(from, to, edge_type)`
    pub fn same_as(&self, from: Uuid, to: Uuid, edge_type: EdgeType) -> bool {
        self.from == from && self.to == to && self.edge_type == edge_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_deduplicated_in_order() {
        let node = MemoryNode::new("u1", Tier::LongTerm, NodeType::Fact, "Paris trip")
            .with_tags(["travel", " france ", "travel", ""]);
        assert_eq!(node.tags, vec!["travel".to_string(), "france".to_string()]);
    }

    #[test]
    fn tag_overlap_counts_shared_tags() {
        let node = MemoryNode::new("u1", Tier::LongTerm, NodeType::Fact, "x")
            .with_tags(["a", "b", "c"]);
        let query: HashSet<&str> = ["b", "c", "d"].into_iter().collect();
        assert_eq!(node.tag_overlap(&query), 2);
    }

    #[test]
    fn enums_parse_their_display_form() {
        for tier in Tier::ALL {
            assert_eq!(tier.to_string().parse::<Tier>().unwrap(), tier);
        }
        assert_eq!("RELATE_TO".parse::<EdgeType>().unwrap(), EdgeType::RelateTo);
        assert_eq!("archived".parse::<NodeStatus>().unwrap(), NodeStatus::Archived);
        assert!("nope".parse::<NodeType>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let edge = MemoryEdge::new(Uuid::new_v4(), Uuid::new_v4(), EdgeType::RelateTo);
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["edge_type"], "RELATE_TO");

        let node = MemoryNode::new("u1", Tier::LongTerm, NodeType::Fact, "x");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["tier"], "long_term");
        assert_eq!(json["status"], "activated");
    }

    #[test]
    fn title_falls_back_to_content() {
        let node = MemoryNode::new("u1", Tier::LongTerm, NodeType::Fact, "short content");
        assert_eq!(node.title(), "short content");
        assert_eq!(node.with_key("k").title(), "k");
    }
}
