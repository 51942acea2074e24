//! Fakes shared by unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::Config;
use crate::embedding::HashEmbedder;
use crate::error::{Error, Result};
use crate::graph::GraphIndex;
use crate::node::{EdgeType, MemoryNode, NodeType, Tier};
use crate::oracle::{ClusterItem, ConceptDraft, RelationKind, SemanticOracle, SubCluster};
use crate::storage::InMemoryVectorIndex;

pub fn embedded(owner: &str, tier: Tier, content: &str, tags: &[&str]) -> MemoryNode {
    MemoryNode::new(owner, tier, NodeType::Fact, content)
        .with_tags(tags.iter().copied())
        .with_embedding(HashEmbedder::default().embed_sync(content))
}

pub fn graph() -> Arc<GraphIndex> {
    Arc::new(GraphIndex::new(Arc::new(InMemoryVectorIndex::new())))
}

pub fn test_config() -> Config {
    let mut config = Config::with_data_dir(std::env::temp_dir().join("strata-memory-tests"));
    config.oracle_timeout = Duration::from_secs(5);
    config
}

fn summary_of(items: &[ClusterItem]) -> ConceptDraft {
    let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
    ConceptDraft {
        key: format!("Summary of {}", items.len()),
        value: keys.join(", "),
        tags: vec!["summary".to_string()],
        background: String::new(),
    }
}

/// Oracle answering from a fixed script, recording every decision it makes
pub struct ScriptedOracle {
    pub relation: RelationKind,
    pub inference: Option<String>,
    pub aggregate: Option<ConceptDraft>,
    /// Sub-cluster size used by `split_cluster`
    pub split_size: usize,
    pub calls: Mutex<Vec<&'static str>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self {
            relation: RelationKind::None,
            inference: None,
            aggregate: None,
            split_size: 5,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedOracle {
    fn record(&self, decision: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(decision);
        }
    }

    pub fn calls(&self, decision: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|c| **c == decision).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SemanticOracle for ScriptedOracle {
    async fn classify_relation(&self, _a: &MemoryNode, _b: &MemoryNode) -> Result<RelationKind> {
        self.record("classify_relation");
        Ok(self.relation)
    }

    async fn derive_inference(
        &self,
        _source: &MemoryNode,
        _target: &MemoryNode,
        _relation: EdgeType,
    ) -> Result<Option<String>> {
        self.record("derive_inference");
        Ok(self.inference.clone())
    }

    async fn propose_aggregate(&self, _nodes: &[MemoryNode]) -> Result<Option<ConceptDraft>> {
        self.record("propose_aggregate");
        Ok(self.aggregate.clone())
    }

    async fn summarize_cluster(&self, items: &[ClusterItem]) -> Result<ConceptDraft> {
        self.record("summarize_cluster");
        Ok(summary_of(items))
    }

    async fn split_cluster(&self, items: &[ClusterItem]) -> Result<Vec<SubCluster>> {
        self.record("split_cluster");
        Ok(items
            .chunks(self.split_size.max(1))
            .enumerate()
            .map(|(i, chunk)| SubCluster {
                ids: chunk.iter().map(|item| item.id).collect(),
                theme: format!("theme {}", i),
            })
            .collect())
    }
}

/// Oracle whose every call fails
#[derive(Default)]
pub struct FailingOracle {
    pub calls: AtomicUsize,
}

impl FailingOracle {
    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::oracle("oracle unavailable"))
    }
}

#[async_trait]
impl SemanticOracle for FailingOracle {
    async fn classify_relation(&self, _a: &MemoryNode, _b: &MemoryNode) -> Result<RelationKind> {
        self.fail()
    }

    async fn derive_inference(
        &self,
        _source: &MemoryNode,
        _target: &MemoryNode,
        _relation: EdgeType,
    ) -> Result<Option<String>> {
        self.fail()
    }

    async fn propose_aggregate(&self, _nodes: &[MemoryNode]) -> Result<Option<ConceptDraft>> {
        self.fail()
    }

    async fn summarize_cluster(&self, _items: &[ClusterItem]) -> Result<ConceptDraft> {
        self.fail()
    }

    async fn split_cluster(&self, _items: &[ClusterItem]) -> Result<Vec<SubCluster>> {
        self.fail()
    }
}

/// Oracle whose first `summarize_cluster` parks until released.
///
/// `entered` is signalled once the call is parked; `stall_forever` makes
/// it never return instead.
#[derive(Default)]
pub struct BlockingOracle {
    pub entered: Notify,
    pub release: Notify,
    pub stall_forever: bool,
    blocked_once: AtomicBool,
}

impl BlockingOracle {
    pub fn stalling() -> Self {
        Self {
            stall_forever: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SemanticOracle for BlockingOracle {
    async fn classify_relation(&self, _a: &MemoryNode, _b: &MemoryNode) -> Result<RelationKind> {
        Ok(RelationKind::None)
    }

    async fn derive_inference(
        &self,
        _source: &MemoryNode,
        _target: &MemoryNode,
        _relation: EdgeType,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn propose_aggregate(&self, _nodes: &[MemoryNode]) -> Result<Option<ConceptDraft>> {
        Ok(None)
    }

    async fn summarize_cluster(&self, items: &[ClusterItem]) -> Result<ConceptDraft> {
        if self.stall_forever {
            std::future::pending::<()>().await;
        }
        if !self.blocked_once.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(summary_of(items))
    }

    async fn split_cluster(&self, _items: &[ClusterItem]) -> Result<Vec<SubCluster>> {
        Ok(Vec::new())
    }
}
