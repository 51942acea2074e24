//! Storage backends for strata-memory

mod jsonl;
mod sqlite;
pub mod vector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::node::{MemoryEdge, MemoryNode};

pub use jsonl::JsonlSnapshotStore;
pub use sqlite::SqliteSnapshotStore;
pub use vector::{
    InMemoryVectorIndex, LanceVectorIndex, MetadataField, SearchResult, VectorFilter, VectorIndex,
    VectorMetadata,
};

/// Every node and edge belonging to one owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub owner_id: String,
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<MemoryNode>,
    pub edges: Vec<MemoryEdge>,
}

impl GraphSnapshot {
    pub fn new(owner_id: impl Into<String>, nodes: Vec<MemoryNode>, edges: Vec<MemoryEdge>) -> Self {
        Self {
            owner_id: owner_id.into(),
            saved_at: Utc::now(),
            nodes,
            edges,
        }
    }
}

/// Durable, whole-graph persistence keyed by owner
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored graph of `snapshot.owner_id`
    fn save(&self, snapshot: &GraphSnapshot) -> Result<()>;

    /// The last saved graph of `owner_id`, if any
    fn load(&self, owner_id: &str) -> Result<Option<GraphSnapshot>>;
}
