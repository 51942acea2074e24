//! The semantic oracle: typed decisions answered by a language model
//!
//! Every method is a single best-effort decision. Callers go through
//! [`consult`], which bounds the call with a timeout and turns ordinary
//! failures into "no result" so one bad answer never sinks a whole pass.

mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::{EdgeType, MemoryNode};

pub use http::HttpOracle;

/// Relation between two statements, as judged by the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    Cause,
    Condition,
    RelateTo,
    Conflict,
    None,
}

impl RelationKind {
    /// Edge to record for this relation; `None` records nothing
    pub fn edge_type(&self) -> Option<EdgeType> {
        match self {
            RelationKind::Cause => Some(EdgeType::Cause),
            RelationKind::Condition => Some(EdgeType::Condition),
            RelationKind::RelateTo => Some(EdgeType::RelateTo),
            RelationKind::Conflict => Some(EdgeType::Conflict),
            RelationKind::None => None,
        }
    }

    /// Relations strong enough to derive a new statement from
    pub fn supports_inference(&self) -> bool {
        matches!(self, RelationKind::Cause | RelationKind::Condition)
    }
}

/// A concept written by the oracle: a summary or an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptDraft {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub background: String,
}

/// What the oracle sees of a node when summarizing or splitting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterItem {
    pub id: Uuid,
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

impl From<&MemoryNode> for ClusterItem {
    fn from(node: &MemoryNode) -> Self {
        Self {
            id: node.id,
            key: node.title(),
            value: node.content.clone(),
            background: node.background.clone(),
        }
    }
}

/// One group proposed when splitting a large cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCluster {
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub theme: String,
}

/// Decisions delegated to a language model
#[async_trait]
pub trait SemanticOracle: Send + Sync {
    async fn classify_relation(&self, a: &MemoryNode, b: &MemoryNode) -> Result<RelationKind>;

    /// One factual statement implied by `source` and `target` under `relation`
    async fn derive_inference(
        &self,
        source: &MemoryNode,
        target: &MemoryNode,
        relation: EdgeType,
    ) -> Result<Option<String>>;

    /// A concept unifying `nodes`, if there is one
    async fn propose_aggregate(&self, nodes: &[MemoryNode]) -> Result<Option<ConceptDraft>>;

    async fn summarize_cluster(&self, items: &[ClusterItem]) -> Result<ConceptDraft>;

    /// Disjoint thematic groups over `items`
    async fn split_cluster(&self, items: &[ClusterItem]) -> Result<Vec<SubCluster>>;
}

/// Run one oracle decision under `timeout`.
///
/// Returns `Ok(None)` when the oracle failed (logged), and `Err` only for a
/// timeout, which callers treat as fatal for the surrounding pass.
pub async fn consult<T, F>(timeout: Duration, decision: &'static str, call: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(Error::timeout(
            format!("oracle {}", decision),
            timeout.as_millis() as u64,
        )),
        Ok(Err(e)) if e.is_timeout() => Err(e),
        Ok(Err(e)) => {
            tracing::warn!(decision, error = %e, "Oracle call failed, skipping decision");
            Ok(None)
        }
        Ok(Ok(value)) => Ok(Some(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consult_passes_values_through() {
        let out = consult(Duration::from_secs(1), "test", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, Some(7));
    }

    #[tokio::test]
    async fn consult_downgrades_failures_to_none() {
        let out: Option<u8> = consult(Duration::from_secs(1), "test", async {
            Err(Error::oracle("malformed reply"))
        })
        .await
        .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn consult_reports_timeouts() {
        let err = consult(Duration::from_millis(50), "test", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn only_causal_relations_support_inference() {
        assert!(RelationKind::Cause.supports_inference());
        assert!(RelationKind::Condition.supports_inference());
        assert!(!RelationKind::Conflict.supports_inference());
        assert_eq!(RelationKind::None.edge_type(), None);
        assert_eq!(RelationKind::RelateTo.edge_type(), Some(EdgeType::RelateTo));
    }
}
