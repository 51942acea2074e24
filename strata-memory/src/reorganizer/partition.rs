//! Two-phase partition of reorganizer candidates
//!
//! Phase one groups nodes by their first frequent tag. Whatever is left is
//! clustered on embeddings. Clusters that end up too small are pooled into
//! one catch-all cluster afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::ReorganizerConfig;
use crate::node::MemoryNode;
use crate::reorganizer::kmeans::kmeans;

/// Where a cluster came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOrigin {
    Tag(String),
    Embedding(usize),
    /// Remainder nodes that carry no embedding
    Unembedded,
    /// Small clusters pooled together
    Pooled,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub origin: ClusterOrigin,
    pub members: Vec<MemoryNode>,
}

impl Cluster {
    fn new(origin: ClusterOrigin, members: Vec<MemoryNode>) -> Self {
        Self { origin, members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Partition `nodes` into final clusters, small ones pooled
pub fn partition(nodes: Vec<MemoryNode>, config: &ReorganizerConfig) -> Vec<Cluster> {
    pool(group(nodes, config), config.min_cluster_size)
}

/// Both phases, before pooling. Every input node lands in exactly one cluster.
pub fn group(nodes: Vec<MemoryNode>, config: &ReorganizerConfig) -> Vec<Cluster> {
    let min_size = config.min_cluster_size.max(1);
    let frequent = frequent_tags(&nodes, config.frequent_tag_top_n, config.frequent_tag_min_count);

    let mut by_tag: BTreeMap<String, Vec<MemoryNode>> = BTreeMap::new();
    let mut remainder = Vec::new();
    for node in nodes {
        match node.tags.iter().find(|t| frequent.contains(t.as_str())) {
            Some(tag) => by_tag.entry(tag.clone()).or_default().push(node),
            None => remainder.push(node),
        }
    }

    let mut clusters = Vec::new();
    for (tag, members) in by_tag {
        if members.len() >= min_size {
            clusters.push(Cluster::new(ClusterOrigin::Tag(tag), members));
        } else {
            remainder.extend(members);
        }
    }
    tracing::debug!(
        tag_clusters = clusters.len(),
        remainder = remainder.len(),
        "Tag grouping done"
    );

    clusters.extend(cluster_embeddings(remainder, config));
    clusters
}

/// Top-`top_n` tags by count, plus any tag seen at least `min_count` times
fn frequent_tags(nodes: &[MemoryNode], top_n: usize, min_count: usize) -> HashSet<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for node in nodes {
        for tag in &node.tags {
            *counts.entry(tag.as_str()).or_default() += 1;
        }
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    ranked
        .iter()
        .enumerate()
        .filter(|(rank, (_, count))| *rank < top_n || *count >= min_count)
        .map(|(_, (tag, _))| tag.to_string())
        .collect()
}

fn cluster_embeddings(nodes: Vec<MemoryNode>, config: &ReorganizerConfig) -> Vec<Cluster> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let (embedded, bare): (Vec<MemoryNode>, Vec<MemoryNode>) =
        nodes.into_iter().partition(|n| n.embedding.is_some());

    let mut clusters = Vec::new();
    if !bare.is_empty() {
        clusters.push(Cluster::new(ClusterOrigin::Unembedded, bare));
    }
    if embedded.is_empty() {
        return clusters;
    }

    let k = (embedded.len() / config.min_cluster_size.max(1)).clamp(1, config.max_clusters.max(1));
    if k <= 1 {
        clusters.push(Cluster::new(ClusterOrigin::Embedding(0), embedded));
        return clusters;
    }

    let points: Vec<Vec<f32>> = embedded
        .iter()
        .map(|n| n.embedding.clone().unwrap_or_default())
        .collect();
    let labels = kmeans(&points, k, config.kmeans_max_iterations, config.kmeans_seed);

    let mut by_label: BTreeMap<usize, Vec<MemoryNode>> = BTreeMap::new();
    for (node, label) in embedded.into_iter().zip(labels) {
        by_label.entry(label).or_default().push(node);
    }
    tracing::debug!(k, clusters = by_label.len(), "Embedding clustering done");

    clusters.extend(
        by_label
            .into_iter()
            .map(|(label, members)| Cluster::new(ClusterOrigin::Embedding(label), members)),
    );
    clusters
}

/// Merge every cluster smaller than `min_size` into one catch-all cluster
pub fn pool(clusters: Vec<Cluster>, min_size: usize) -> Vec<Cluster> {
    let mut kept = Vec::new();
    let mut pooled = Vec::new();
    for cluster in clusters {
        if cluster.len() < min_size {
            pooled.extend(cluster.members);
        } else {
            kept.push(cluster);
        }
    }
    if !pooled.is_empty() {
        kept.push(Cluster::new(ClusterOrigin::Pooled, pooled));
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::node::{NodeType, Tier};
    use uuid::Uuid;

    fn node(content: &str, tags: &[&str]) -> MemoryNode {
        MemoryNode::new("u1", Tier::LongTerm, NodeType::Fact, content)
            .with_tags(tags.iter().copied())
            .with_embedding(HashEmbedder::default().embed_sync(content))
    }

    fn ids(clusters: &[Cluster]) -> Vec<Uuid> {
        clusters
            .iter()
            .flat_map(|c| c.members.iter().map(|n| n.id))
            .collect()
    }

    #[test]
    fn grouping_covers_every_node_exactly_once() {
        let config = ReorganizerConfig {
            frequent_tag_top_n: 2,
            ..Default::default()
        };
        let mut nodes = Vec::new();
        for i in 0..5 {
            nodes.push(node(&format!("trip {}", i), &["travel", "food"]));
        }
        for i in 0..4 {
            nodes.push(node(&format!("meal {}", i), &["food"]));
        }
        nodes.push(node("lonely", &["rare"]));
        for i in 0..7 {
            nodes.push(node(&format!("misc note number {}", i), &[]));
        }
        let mut bare = node("no vector", &[]);
        bare.embedding = None;
        nodes.push(bare);

        let input: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();
        let clusters = group(nodes, &config);
        let output = ids(&clusters);

        assert_eq!(output.len(), input.len());
        assert_eq!(output.into_iter().collect::<HashSet<_>>(), input);
    }

    #[test]
    fn nodes_join_their_first_frequent_tag() {
        let config = ReorganizerConfig::default();
        let mut nodes = Vec::new();
        for i in 0..3 {
            nodes.push(node(&format!("a{}", i), &["alpha", "beta"]));
        }
        for i in 0..3 {
            nodes.push(node(&format!("b{}", i), &["beta", "alpha"]));
        }

        let clusters = group(nodes, &config);
        let origins: Vec<&ClusterOrigin> = clusters.iter().map(|c| &c.origin).collect();
        assert_eq!(
            origins,
            vec![
                &ClusterOrigin::Tag("alpha".to_string()),
                &ClusterOrigin::Tag("beta".to_string())
            ]
        );
        assert!(clusters.iter().all(|c| c.len() == 3));
    }

    #[test]
    fn single_shared_tag_forms_one_cluster() {
        let nodes: Vec<MemoryNode> = (0..12)
            .map(|i| node(&format!("visited city {}", i), &["travel"]))
            .collect();
        let clusters = partition(nodes, &ReorganizerConfig::default());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].origin, ClusterOrigin::Tag("travel".to_string()));
        assert_eq!(clusters[0].len(), 12);
    }

    #[test]
    fn frequent_tags_include_top_n_and_heavy_hitters() {
        let mut nodes = Vec::new();
        for _ in 0..3 {
            nodes.push(node("x", &["common"]));
        }
        nodes.push(node("y", &["rare"]));
        let frequent = frequent_tags(&nodes, 1, 50);
        assert!(frequent.contains("common"));
        assert!(!frequent.contains("rare"));

        let frequent = frequent_tags(&nodes, 0, 1);
        assert_eq!(frequent.len(), 2);
    }

    #[test]
    fn small_clusters_are_pooled() {
        let a = Cluster::new(ClusterOrigin::Embedding(0), vec![node("a", &[])]);
        let b = Cluster::new(ClusterOrigin::Embedding(1), vec![node("b", &[]), node("c", &[])]);
        let c = Cluster::new(
            ClusterOrigin::Tag("t".to_string()),
            vec![node("d", &[]), node("e", &[]), node("f", &[])],
        );

        let pooled = pool(vec![a, b, c], 3);
        assert_eq!(pooled.len(), 2);
        assert_eq!(pooled[0].origin, ClusterOrigin::Tag("t".to_string()));
        assert_eq!(pooled[1].origin, ClusterOrigin::Pooled);
        assert_eq!(pooled[1].len(), 3);
    }
}
