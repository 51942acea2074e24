//! Background consolidation of a tier into a summarized hierarchy
//!
//! A pass scans for loose nodes, clusters them, writes a topic node over
//! each cluster (splitting large clusters into sub-topics first) and then
//! runs the relation reasoner over every clustered node.

mod kmeans;
pub mod partition;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::config::{Config, ReorganizerConfig};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::graph::GraphIndex;
use crate::memory::{TieredMemory, TierGates};
use crate::node::{MemoryEdge, MemoryNode, NodeType, Tier};
use crate::oracle::{consult, ClusterItem, ConceptDraft, SemanticOracle, SubCluster};
use crate::reasoner::RelationReasoner;

pub use partition::{Cluster, ClusterOrigin};

/// Sub-clusters outside this size range are dropped or trimmed
const MIN_SUB_CLUSTER: usize = 2;
const MAX_SUB_CLUSTER: usize = 10;

/// How a pass ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReorganizeOutcome {
    AlreadyRunning,
    NoActiveNodes,
    TooFewCandidates { found: usize, required: usize },
    Completed,
}

/// What a pass did
#[derive(Debug, Clone, Serialize)]
pub struct ReorganizeReport {
    pub tier: Tier,
    pub outcome: ReorganizeOutcome,
    pub candidates: usize,
    pub clusters: usize,
    /// Topic nodes created, sub-topics and top parents included
    pub summary_nodes: Vec<Uuid>,
    pub parent_edges: usize,
    pub relation_edges: usize,
    pub sequence_edges: usize,
    pub inferred_nodes: usize,
    pub aggregate_nodes: usize,
}

impl ReorganizeReport {
    fn new(tier: Tier, outcome: ReorganizeOutcome) -> Self {
        Self {
            tier,
            outcome,
            candidates: 0,
            clusters: 0,
            summary_nodes: Vec::new(),
            parent_edges: 0,
            relation_edges: 0,
            sequence_edges: 0,
            inferred_nodes: 0,
            aggregate_nodes: 0,
        }
    }
}

/// Marks a tier as running; cleared on drop, whatever the exit path
struct RunFlag<'a> {
    running: &'a Mutex<HashSet<Tier>>,
    tier: Tier,
}

impl<'a> RunFlag<'a> {
    fn acquire(running: &'a Mutex<HashSet<Tier>>, tier: Tier) -> Option<Self> {
        let mut set = running.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(tier) {
            Some(Self { running, tier })
        } else {
            None
        }
    }
}

impl Drop for RunFlag<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tier);
    }
}

pub struct Reorganizer {
    graph: Arc<GraphIndex>,
    oracle: Arc<dyn SemanticOracle>,
    embedder: Arc<dyn Embedder>,
    reasoner: RelationReasoner,
    gates: Arc<TierGates>,
    running: Mutex<HashSet<Tier>>,
    config: ReorganizerConfig,
    oracle_timeout: std::time::Duration,
}

impl Reorganizer {
    /// Reorganizer sharing `memory`'s graph, embedder and tier gates
    pub fn for_memory(memory: &TieredMemory, oracle: Arc<dyn SemanticOracle>) -> Self {
        Self::new(
            memory.config(),
            memory.graph().clone(),
            oracle,
            memory.embedder().clone(),
            memory.gates().clone(),
        )
    }

    pub fn new(
        config: &Config,
        graph: Arc<GraphIndex>,
        oracle: Arc<dyn SemanticOracle>,
        embedder: Arc<dyn Embedder>,
        gates: Arc<TierGates>,
    ) -> Self {
        let reasoner = RelationReasoner::new(
            graph.clone(),
            oracle.clone(),
            embedder.clone(),
            config.oracle_timeout,
        );
        Self {
            graph,
            oracle,
            embedder,
            reasoner,
            gates,
            running: Mutex::new(HashSet::new()),
            config: config.reorganizer.clone(),
            oracle_timeout: config.oracle_timeout,
        }
    }

    pub fn is_running(&self, tier: Tier) -> bool {
        self.running
            .lock()
            .map(|set| set.contains(&tier))
            .unwrap_or(false)
    }

    /// Run a pass over `tier` with the configured parameters
    pub async fn run(&self, tier: Tier) -> Result<ReorganizeReport> {
        let config = self.config.clone();
        self.run_with(tier, &config).await
    }

    /// Run a pass over `tier`.
    ///
    /// Returns at once if a pass over the same tier is in flight. Writers to
    /// the tier wait until the pass is over. An oracle timeout aborts the
    /// pass with an error; work done before it is kept.
    pub async fn run_with(&self, tier: Tier, config: &ReorganizerConfig) -> Result<ReorganizeReport> {
        let Some(_flag) = RunFlag::acquire(&self.running, tier) else {
            tracing::info!(%tier, "Reorganizer already running, skipping");
            return Ok(ReorganizeReport::new(tier, ReorganizeOutcome::AlreadyRunning));
        };
        let _gate = self.gates.get(tier).write().await;

        let active = self.graph.active_nodes(tier, None);
        if active.is_empty() {
            tracing::info!(%tier, "No activated nodes, skipping reorganize");
            return Ok(ReorganizeReport::new(tier, ReorganizeOutcome::NoActiveNodes));
        }

        let candidates = self.candidates(&active);
        let mut by_owner: BTreeMap<String, Vec<MemoryNode>> = BTreeMap::new();
        for node in candidates {
            by_owner.entry(node.owner_id.clone()).or_default().push(node);
        }

        let total: usize = by_owner.values().map(Vec::len).sum();
        let mut report = ReorganizeReport::new(
            tier,
            ReorganizeOutcome::TooFewCandidates {
                found: total,
                required: config.min_group_size,
            },
        );
        report.candidates = total;
        tracing::info!(%tier, active = active.len(), candidates = total, "Reorganize started");

        for (owner_id, nodes) in by_owner {
            if nodes.len() < config.min_group_size {
                tracing::debug!(%tier, owner_id = %owner_id, found = nodes.len(), "Too few candidates for owner");
                continue;
            }
            report.outcome = ReorganizeOutcome::Completed;
            self.consolidate_owner(tier, &owner_id, nodes, config, &mut report)
                .await?;
        }

        tracing::info!(
            %tier,
            outcome = ?report.outcome,
            clusters = report.clusters,
            summaries = report.summary_nodes.len(),
            relations = report.relation_edges,
            "Reorganize finished"
        );
        Ok(report)
    }

    /// Activated nodes that are isolated, lack a background, or head a
    /// single-child chain (the child is taken too).
    ///
    /// Nodes already under an activated parent stay where they are, unless
    /// they are the child of a single-child chain.
    fn candidates(&self, active: &[MemoryNode]) -> Vec<MemoryNode> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |node: MemoryNode, out: &mut Vec<MemoryNode>| {
            if seen.insert(node.id) {
                out.push(node);
            }
        };

        for node in active {
            let parent = self.graph.parent_of(node.id);
            let placed = parent
                .and_then(|p| self.graph.get_node(p))
                .map_or(false, |p| p.is_active());
            if placed {
                continue;
            }

            let children = self.graph.children_ids(node.id);
            let isolated = children.is_empty() && parent.is_none();
            let no_background = node.background.as_deref().map_or(true, |b| b.trim().is_empty());

            if isolated || no_background || children.len() == 1 {
                push(node.clone(), &mut out);
            }
            if children.len() == 1 {
                if let Some(child) = self.graph.get_node(children[0]).filter(|c| c.is_active()) {
                    push(child, &mut out);
                }
            }
        }
        out
    }

    async fn consolidate_owner(
        &self,
        tier: Tier,
        owner_id: &str,
        nodes: Vec<MemoryNode>,
        config: &ReorganizerConfig,
        report: &mut ReorganizeReport,
    ) -> Result<()> {
        let partition_config = config.clone();
        let clusters = tokio::task::spawn_blocking(move || {
            partition::partition(nodes, &partition_config)
        })
        .await?;

        tracing::debug!(%tier, owner_id, clusters = clusters.len(), "Partitioned candidates");
        report.clusters += clusters.len();

        for cluster in &clusters {
            if cluster.len() < 2 {
                // A topic over one node is a single-child chain
                tracing::debug!(%tier, owner_id, "Leaving singleton cluster unsummarized");
            } else if cluster.len() <= config.local_tree_threshold {
                self.summarize_into_topic(tier, owner_id, &cluster.members, report)
                    .await?;
            } else {
                self.split_into_subtopics(tier, owner_id, &cluster.members, report)
                    .await?;
            }
        }

        let members: Vec<&MemoryNode> = clusters.iter().flat_map(|c| c.members.iter()).collect();
        let exclude: HashSet<Uuid> = members.iter().map(|n| n.id).collect();
        for member in members {
            let reasoning = self
                .reasoner
                .process(member, &exclude, config.relation_top_k)
                .await?;
            if reasoning.is_empty() {
                continue;
            }
            let applied = self.reasoner.apply(reasoning).await?;
            report.relation_edges += applied.relation_edges;
            report.sequence_edges += applied.sequence_edges;
            report.inferred_nodes += applied.inferred_nodes;
            report.aggregate_nodes += applied.aggregate_nodes;
        }
        Ok(())
    }

    /// Summarize `members` into a new topic node and link it above them.
    /// `None` when the oracle gave no summary.
    async fn summarize_into_topic(
        &self,
        tier: Tier,
        owner_id: &str,
        members: &[MemoryNode],
        report: &mut ReorganizeReport,
    ) -> Result<Option<MemoryNode>> {
        let items: Vec<ClusterItem> = members.iter().map(ClusterItem::from).collect();
        let Some(draft) = consult(
            self.oracle_timeout,
            "summarize_cluster",
            self.oracle.summarize_cluster(&items),
        )
        .await?
        else {
            return Ok(None);
        };

        let topic = self.topic_node(tier, owner_id, draft, members).await;
        self.graph.add_node(topic.clone()).await?;
        report.summary_nodes.push(topic.id);

        for member in members {
            match self.graph.add_edge(MemoryEdge::parent(topic.id, member.id)) {
                Ok(true) => report.parent_edges += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(topic = %topic.id, member = %member.id, error = %e, "Skipping PARENT link"),
            }
        }
        Ok(Some(topic))
    }

    async fn split_into_subtopics(
        &self,
        tier: Tier,
        owner_id: &str,
        members: &[MemoryNode],
        report: &mut ReorganizeReport,
    ) -> Result<()> {
        let items: Vec<ClusterItem> = members.iter().map(ClusterItem::from).collect();
        let proposed = consult(
            self.oracle_timeout,
            "split_cluster",
            self.oracle.split_cluster(&items),
        )
        .await?
        .unwrap_or_default();

        let groups = sanitize_split(proposed, members);
        tracing::debug!(owner_id, size = members.len(), sub_clusters = groups.len(), "Split large cluster");

        let mut sub_parents = Vec::new();
        for group in groups {
            if let Some(topic) = self.summarize_into_topic(tier, owner_id, &group, report).await? {
                sub_parents.push(topic);
            }
        }
        if !sub_parents.is_empty() {
            self.summarize_into_topic(tier, owner_id, &sub_parents, report)
                .await?;
        }
        Ok(())
    }

    async fn topic_node(
        &self,
        tier: Tier,
        owner_id: &str,
        draft: ConceptDraft,
        members: &[MemoryNode],
    ) -> MemoryNode {
        let mut topic = MemoryNode::new(owner_id, tier, NodeType::Topic, draft.value)
            .with_key(draft.key)
            .with_tags(draft.tags)
            .with_sources(members.iter().map(|m| m.id).collect());
        if !draft.background.is_empty() {
            topic.background = Some(draft.background);
        }
        match self.embedder.embed(&topic.embedding_text()).await {
            Ok(embedding) => topic.embedding = Some(embedding),
            Err(e) => tracing::warn!(error = %e, "Topic node stored without embedding"),
        }
        topic
    }
}

/// Keep ids that belong to the cluster, each at most once, in groups of
/// 2 to 10; everything else is dropped
fn sanitize_split(proposed: Vec<SubCluster>, members: &[MemoryNode]) -> Vec<Vec<MemoryNode>> {
    let by_id: HashMap<Uuid, &MemoryNode> = members.iter().map(|m| (m.id, m)).collect();
    let mut assigned = HashSet::new();
    let mut groups = Vec::new();

    for sub in proposed {
        let mut group: Vec<MemoryNode> = Vec::new();
        for id in sub.ids {
            if group.len() == MAX_SUB_CLUSTER {
                break;
            }
            if let Some(node) = by_id.get(&id) {
                if assigned.insert(id) {
                    group.push((*node).clone());
                }
            }
        }
        if group.len() >= MIN_SUB_CLUSTER {
            groups.push(group);
        } else {
            for node in &group {
                assigned.remove(&node.id);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::node::EdgeType;
    use crate::oracle::RelationKind;
    use crate::test_support::{embedded, graph, test_config, BlockingOracle, ScriptedOracle};
    use std::time::Duration;

    fn reorganizer(graph: &Arc<GraphIndex>, oracle: Arc<dyn SemanticOracle>, config: &Config) -> Reorganizer {
        Reorganizer::new(
            config,
            graph.clone(),
            oracle,
            Arc::new(HashEmbedder::default()),
            Arc::new(TierGates::default()),
        )
    }

    async fn seed(graph: &GraphIndex, tier: Tier, count: usize, tags: &[&str]) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for i in 0..count {
            let node = embedded("u1", tier, &format!("memory {} about {}", i, tags.join(" ")), tags);
            ids.push(node.id);
            graph.add_node(node).await.unwrap();
        }
        ids
    }

    #[tokio::test]
    async fn shared_tag_cluster_gets_one_topic_parent() {
        let graph = graph();
        let members = seed(&graph, Tier::LongTerm, 12, &["travel"]).await;
        let mut config = test_config();
        config.reorganizer.local_tree_threshold = 12;
        let oracle = Arc::new(ScriptedOracle::default());
        let reorganizer = reorganizer(&graph, oracle.clone(), &config);

        let report = reorganizer.run(Tier::LongTerm).await.unwrap();

        assert_eq!(report.outcome, ReorganizeOutcome::Completed);
        assert_eq!(report.clusters, 1);
        assert_eq!(report.summary_nodes.len(), 1);
        assert_eq!(report.parent_edges, 12);
        assert_eq!(graph.len(), 13);
        assert_eq!(graph.edge_count(), 12);

        let topic = graph.get_node(report.summary_nodes[0]).unwrap();
        assert_eq!(topic.node_type, NodeType::Topic);
        assert_eq!(topic.tier, Tier::LongTerm);
        let children: HashSet<Uuid> = graph.children_ids(topic.id).into_iter().collect();
        assert_eq!(children, members.iter().copied().collect());
        assert_eq!(oracle.calls("summarize_cluster"), 1);
        assert_eq!(oracle.calls("split_cluster"), 0);
        graph.verify_hierarchy().unwrap();
        assert!(!reorganizer.is_running(Tier::LongTerm));
    }

    #[tokio::test]
    async fn large_cluster_is_split_under_a_top_parent() {
        let graph = graph();
        let members = seed(&graph, Tier::User, 12, &["music"]).await;
        let oracle = Arc::new(ScriptedOracle {
            split_size: 5,
            ..Default::default()
        });
        let reorganizer = reorganizer(&graph, oracle.clone(), &test_config());

        let report = reorganizer.run(Tier::User).await.unwrap();

        // 5 + 5 + 2 members, then a top parent over the three sub-topics
        assert_eq!(oracle.calls("split_cluster"), 1);
        assert_eq!(report.summary_nodes.len(), 4);
        assert_eq!(report.parent_edges, 12 + 3);

        let top = *report.summary_nodes.last().unwrap();
        assert_eq!(graph.children_ids(top).len(), 3);
        for member in members {
            let parent = graph.parent_of(member).expect("member linked");
            assert_eq!(graph.parent_of(parent), Some(top));
        }
        graph.verify_hierarchy().unwrap();
    }

    #[tokio::test]
    async fn too_few_candidates_change_nothing() {
        let graph = graph();
        seed(&graph, Tier::LongTerm, 4, &["travel"]).await;
        let oracle = Arc::new(ScriptedOracle::default());
        let reorganizer = reorganizer(&graph, oracle.clone(), &test_config());

        let report = reorganizer.run(Tier::LongTerm).await.unwrap();
        assert_eq!(
            report.outcome,
            ReorganizeOutcome::TooFewCandidates { found: 4, required: 10 }
        );
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.edge_count(), 0);
        assert!(!reorganizer.is_running(Tier::LongTerm));

        // The flag is clear, so the next run is not reported as a collision
        let again = reorganizer.run(Tier::LongTerm).await.unwrap();
        assert_ne!(again.outcome, ReorganizeOutcome::AlreadyRunning);
    }

    fn topics(graph: &GraphIndex) -> Vec<MemoryNode> {
        graph.nodes(|n| n.node_type == NodeType::Topic)
    }

    #[tokio::test]
    async fn repeated_passes_keep_earlier_topics_intact() {
        let graph = graph();
        let first_batch: HashSet<Uuid> = seed(&graph, Tier::LongTerm, 10, &["travel"])
            .await
            .into_iter()
            .collect();
        let reorganizer = reorganizer(&graph, Arc::new(ScriptedOracle::default()), &test_config());

        let first = reorganizer.run(Tier::LongTerm).await.unwrap();
        assert_eq!(first.outcome, ReorganizeOutcome::Completed);
        let topic = first.summary_nodes[0];

        // Only the new topic is loose now
        for _ in 0..2 {
            let again = reorganizer.run(Tier::LongTerm).await.unwrap();
            assert_eq!(
                again.outcome,
                ReorganizeOutcome::TooFewCandidates { found: 1, required: 10 }
            );
        }
        assert_eq!(topics(&graph).len(), 1);
        let children: HashSet<Uuid> = graph.children_ids(topic).into_iter().collect();
        assert_eq!(children, first_batch);

        // A fresh batch gets its own topic; the old one keeps its children
        let second_batch: HashSet<Uuid> = seed(&graph, Tier::LongTerm, 10, &["travel"])
            .await
            .into_iter()
            .collect();
        let second = reorganizer.run(Tier::LongTerm).await.unwrap();
        assert_eq!(second.outcome, ReorganizeOutcome::Completed);
        assert_eq!(second.summary_nodes.len(), 1);

        let children: HashSet<Uuid> = graph.children_ids(topic).into_iter().collect();
        assert_eq!(children, first_batch);
        let children: HashSet<Uuid> = graph
            .children_ids(second.summary_nodes[0])
            .into_iter()
            .collect();
        assert_eq!(children, second_batch);
        assert!(topics(&graph)
            .iter()
            .all(|t| !graph.children_ids(t.id).is_empty()));
        graph.verify_hierarchy().unwrap();
    }

    #[tokio::test]
    async fn writers_to_a_tier_wait_for_its_pass() {
        let memory = Arc::new(TieredMemory::new(
            test_config(),
            graph(),
            Arc::new(HashEmbedder::default()),
            Arc::new(crate::storage::SqliteSnapshotStore::in_memory().unwrap()),
        ));
        seed(memory.graph(), Tier::LongTerm, 10, &["work"]).await;
        let oracle = Arc::new(BlockingOracle::default());
        let reorganizer = Arc::new(Reorganizer::for_memory(&memory, oracle.clone()));

        let pass = {
            let reorganizer = reorganizer.clone();
            tokio::spawn(async move { reorganizer.run(Tier::LongTerm).await })
        };
        oracle.entered.notified().await;

        let long_term = MemoryNode::new("u1", Tier::LongTerm, NodeType::Fact, "started pottery classes");
        let parked = {
            let memory = memory.clone();
            let node = long_term.clone();
            tokio::spawn(async move { memory.add(vec![node]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());
        assert!(!memory.graph().contains(long_term.id));

        // Other tiers are not gated by this pass
        let user = MemoryNode::new("u1", Tier::User, NodeType::Preference, "likes quiet mornings");
        let outcomes = tokio::time::timeout(Duration::from_secs(1), memory.add(vec![user.clone()]))
            .await
            .expect("User write is not blocked")
            .unwrap();
        assert_eq!(outcomes[0].ingested, Some(crate::memory::Ingested::Inserted(user.id)));

        oracle.release.notify_one();
        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.outcome, ReorganizeOutcome::Completed);

        let outcomes = parked.await.unwrap().unwrap();
        assert_eq!(
            outcomes[0].ingested,
            Some(crate::memory::Ingested::Inserted(long_term.id))
        );
        // The parked write landed after the pass, so no topic covers it
        assert!(memory.graph().contains(long_term.id));
        assert!(memory.graph().parent_of(long_term.id).is_none());
    }

    #[tokio::test]
    async fn empty_tier_is_skipped() {
        let graph = graph();
        let reorganizer = reorganizer(&graph, Arc::new(ScriptedOracle::default()), &test_config());
        let report = reorganizer.run(Tier::User).await.unwrap();
        assert_eq!(report.outcome, ReorganizeOutcome::NoActiveNodes);
    }

    #[tokio::test]
    async fn overlapping_runs_on_one_tier_are_rejected() {
        let graph = graph();
        seed(&graph, Tier::LongTerm, 10, &["work"]).await;
        seed(&graph, Tier::User, 10, &["family"]).await;
        let oracle = Arc::new(BlockingOracle::default());
        let reorganizer = Arc::new(reorganizer(&graph, oracle.clone(), &test_config()));

        let first = {
            let reorganizer = reorganizer.clone();
            tokio::spawn(async move { reorganizer.run(Tier::LongTerm).await })
        };
        oracle.entered.notified().await;
        assert!(reorganizer.is_running(Tier::LongTerm));

        let nodes_before = graph.len();
        let edges_before = graph.edge_count();
        let second = reorganizer.run(Tier::LongTerm).await.unwrap();
        assert_eq!(second.outcome, ReorganizeOutcome::AlreadyRunning);
        assert_eq!(graph.len(), nodes_before);
        assert_eq!(graph.edge_count(), edges_before);

        let other = reorganizer.run(Tier::User).await.unwrap();
        assert_eq!(other.outcome, ReorganizeOutcome::Completed);
        assert_eq!(other.summary_nodes.len(), 1);

        oracle.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.outcome, ReorganizeOutcome::Completed);
        assert!(!reorganizer.is_running(Tier::LongTerm));
    }

    #[tokio::test]
    async fn oracle_timeout_aborts_the_pass_and_clears_the_flag() {
        let graph = graph();
        seed(&graph, Tier::LongTerm, 10, &["work"]).await;
        let mut config = test_config();
        config.oracle_timeout = Duration::from_millis(50);
        let reorganizer = reorganizer(&graph, Arc::new(BlockingOracle::stalling()), &config);

        let err = reorganizer.run(Tier::LongTerm).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!reorganizer.is_running(Tier::LongTerm));
        assert_eq!(graph.edge_count(), 0);
    }

    #[tokio::test]
    async fn single_child_chains_contribute_both_nodes() {
        let graph = graph();
        let parent = embedded("u1", Tier::LongTerm, "parent", &[]).with_background("has context");
        let child = embedded("u1", Tier::LongTerm, "child", &[]).with_background("has context");
        let settled = embedded("u1", Tier::LongTerm, "settled", &[]).with_background("has context");
        let sibling = embedded("u1", Tier::LongTerm, "sibling", &[]).with_background("has context");
        for n in [&parent, &child, &settled, &sibling] {
            graph.add_node(n.clone()).await.unwrap();
        }
        graph.add_edge(MemoryEdge::parent(parent.id, child.id)).unwrap();
        let hub = embedded("u1", Tier::LongTerm, "hub", &[]).with_background("has context");
        graph.add_node(hub.clone()).await.unwrap();
        graph.add_edge(MemoryEdge::parent(hub.id, settled.id)).unwrap();
        graph.add_edge(MemoryEdge::parent(hub.id, sibling.id)).unwrap();

        let reorganizer = reorganizer(&graph, Arc::new(ScriptedOracle::default()), &test_config());
        let active = graph.active_nodes(Tier::LongTerm, None);
        let ids: HashSet<Uuid> = reorganizer.candidates(&active).iter().map(|n| n.id).collect();

        assert_eq!(ids, [parent.id, child.id].into_iter().collect());
    }

    #[test]
    fn split_results_are_sanitized() {
        let members: Vec<MemoryNode> = (0..14)
            .map(|i| embedded("u1", Tier::LongTerm, &format!("m{}", i), &[]))
            .collect();
        let id = |i: usize| members[i].id;
        let proposed = vec![
            SubCluster { ids: vec![id(0), id(1), Uuid::new_v4()], theme: "a".into() },
            // id(1) already taken, leaving a singleton
            SubCluster { ids: vec![id(1), id(2)], theme: "b".into() },
            SubCluster { ids: (2..14).map(id).collect(), theme: "c".into() },
        ];

        let groups = sanitize_split(proposed, &members);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].iter().map(|n| n.id).collect::<Vec<_>>(), vec![id(0), id(1)]);
        assert_eq!(groups[1].len(), MAX_SUB_CLUSTER);
        assert_eq!(groups[1][0].id, id(2));
    }

    #[tokio::test]
    async fn reasoner_runs_over_cluster_members() {
        let graph = graph();
        seed(&graph, Tier::LongTerm, 10, &["garden", "spring"]).await;
        let outsider = embedded("u1", Tier::LongTerm, "outsider", &["garden", "spring"])
            .with_background("has context");
        let inner = embedded("u1", Tier::LongTerm, "inner", &[]).with_background("has context");
        graph.add_node(outsider.clone()).await.unwrap();
        graph.add_node(inner.clone()).await.unwrap();
        graph.add_edge(MemoryEdge::parent(outsider.id, inner.id)).unwrap();
        let extra = embedded("u1", Tier::LongTerm, "extra", &[]).with_background("has context");
        graph.add_node(extra.clone()).await.unwrap();
        graph.add_edge(MemoryEdge::parent(outsider.id, extra.id)).unwrap();

        let oracle = Arc::new(ScriptedOracle {
            relation: RelationKind::RelateTo,
            ..Default::default()
        });
        let reorganizer = reorganizer(&graph, oracle.clone(), &test_config());
        let report = reorganizer.run(Tier::LongTerm).await.unwrap();

        assert_eq!(report.outcome, ReorganizeOutcome::Completed);
        // Each of the 10 members relates to the one non-member sharing its tags
        assert_eq!(report.relation_edges, 10);
        assert!(graph.edge_exists(
            graph.nodes(|n| n.content == "memory 0 about garden spring")[0].id,
            outsider.id,
            EdgeType::RelateTo
        ));
    }
}
