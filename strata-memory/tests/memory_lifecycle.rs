//! End-to-end: ingest, consolidate, retrieve, persist and reload

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use strata_memory::embedding::HashEmbedder;
use strata_memory::graph::GraphIndex;
use strata_memory::memory::Ingested;
use strata_memory::oracle::{ClusterItem, ConceptDraft, RelationKind, SubCluster};
use strata_memory::storage::{InMemoryVectorIndex, JsonlSnapshotStore};
use strata_memory::{
    Config, EdgeType, MemoryNode, NodeType, ReorganizeOutcome, Reorganizer, Result,
    SemanticOracle, TieredMemory, Tier,
};

const OWNER: &str = "traveller";

const TRIPS: [&str; 12] = [
    "lisbon trams climb steep hills",
    "kyoto temples open before sunrise",
    "oslo ferries cross fjords hourly",
    "cairo museum holds golden masks",
    "lima markets sell purple corn",
    "reykjavik pools stay warm outdoors",
    "hanoi scooters flood narrow lanes",
    "vienna cafes serve apple strudel",
    "nairobi park shelters wild giraffes",
    "quebec walls surround old quarter",
    "tbilisi baths smell of sulphur",
    "perth beaches face indian ocean",
];

/// Oracle with fixed answers: no relations, one summary per cluster
struct FixedOracle;

#[async_trait]
impl SemanticOracle for FixedOracle {
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

    async fn summarize_cluster(&self, _items: &[ClusterItem]) -> Result<ConceptDraft> {
        Ok(ConceptDraft {
            key: "Travel".to_string(),
            value: "travel plans summary".to_string(),
            tags: vec!["travel".to_string()],
            background: String::new(),
        })
    }

    async fn split_cluster(&self, items: &[ClusterItem]) -> Result<Vec<SubCluster>> {
        Ok(items
            .chunks(5)
            .map(|chunk| SubCluster {
                ids: chunk.iter().map(|i| i.id).collect(),
                theme: String::new(),
            })
            .collect())
    }
}

fn config(dir: &std::path::Path) -> Config {
    let mut config = Config::with_data_dir(dir);
    config.oracle_timeout = Duration::from_secs(5);
    config.reorganizer.local_tree_threshold = 12;
    config
}

fn open_memory(config: &Config) -> TieredMemory {
    TieredMemory::new(
        config.clone(),
        Arc::new(GraphIndex::new(Arc::new(InMemoryVectorIndex::new()))),
        Arc::new(HashEmbedder::default()),
        Arc::new(JsonlSnapshotStore::new(config).unwrap()),
    )
}

#[tokio::test]
async fn memories_survive_consolidation_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let memory = open_memory(&config);

    let batch: Vec<MemoryNode> = TRIPS
        .iter()
        .map(|text| {
            MemoryNode::new(OWNER, Tier::LongTerm, NodeType::Fact, *text).with_tags(["travel"])
        })
        .collect();
    let outcomes = memory.add(batch).await.unwrap();
    assert_eq!(outcomes.len(), TRIPS.len());
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.ingested, Some(Ingested::Inserted(_)))));

    let stats = memory.stats();
    assert_eq!(stats.sizes.working, TRIPS.len());
    assert_eq!(stats.sizes.long_term, TRIPS.len());

    // A direct hit on one fact
    let context = memory.search(TRIPS[2], 1, OWNER).await.unwrap();
    assert_eq!(context.hits.len(), 1);
    assert!(context.text.contains("oslo ferries"));

    let reorganizer = Reorganizer::for_memory(&memory, Arc::new(FixedOracle));
    let report = reorganizer.run(Tier::LongTerm).await.unwrap();
    assert_eq!(report.outcome, ReorganizeOutcome::Completed);
    assert_eq!(report.summary_nodes.len(), 1);
    assert_eq!(report.parent_edges, TRIPS.len());

    let topic_id = report.summary_nodes[0];
    let children: HashSet<Uuid> = memory.graph().children_ids(topic_id).into_iter().collect();
    assert_eq!(children.len(), TRIPS.len());
    memory.graph().verify_hierarchy().unwrap();

    // The topic now pulls its whole subtree into the context
    let context = memory.search("travel plans summary", 1, OWNER).await.unwrap();
    assert_eq!(context.hits[0].id, topic_id);
    assert_eq!(context.node_ids.len(), TRIPS.len() + 1);
    assert!(context.text.starts_with("- [topic] Travel: travel plans summary\n"));
    for trip in TRIPS {
        assert!(context.text.contains(trip));
    }

    memory.save(OWNER).unwrap();

    let reloaded = open_memory(&config);
    let summary = reloaded.load(OWNER).await.unwrap().unwrap();
    assert_eq!(summary.nodes, memory.graph().len());
    assert_eq!(summary.skipped_edges, 0);
    assert_eq!(reloaded.graph().edge_count(), memory.graph().edge_count());
    assert_eq!(reloaded.graph().children_ids(topic_id).len(), TRIPS.len());
    reloaded.graph().verify_hierarchy().unwrap();

    let context = reloaded.search("travel plans summary", 1, OWNER).await.unwrap();
    assert_eq!(context.hits[0].id, topic_id);

    assert!(reloaded.load("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn near_duplicates_merge_instead_of_piling_up() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open_memory(&config(dir.path()));

    let first = MemoryNode::new(OWNER, Tier::User, NodeType::Preference, "prefers window seats on long flights");
    let again = MemoryNode::new(OWNER, Tier::User, NodeType::Preference, "prefers window seats on long flights")
        .with_tags(["flights"]);

    let outcomes = memory.add(vec![first]).await.unwrap();
    let Some(Ingested::Inserted(id)) = outcomes[0].ingested else {
        panic!("first write should insert");
    };
    let outcomes = memory.add(vec![again]).await.unwrap();
    assert_eq!(outcomes[0].ingested, Some(Ingested::Merged(id)));

    let merged = memory.get(id).unwrap();
    assert!(merged.has_tag("flights"));
    assert_eq!(memory.stats().sizes.user, 1);
    assert_eq!(memory.stats().sizes.working, 2);
}
