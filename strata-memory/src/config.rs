//! Configuration for strata-memory

use std::path::PathBuf;
use std::time::Duration;

use crate::node::Tier;

/// Which vector index backs similarity search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    /// Brute-force cosine search held in process memory
    InMemory,
    /// LanceDB table under `vector_db_path()`
    Lance,
}

/// Which durable store holds per-owner graph snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBackend {
    Sqlite,
    Jsonl,
}

/// Tuning for the background consolidation pass
#[derive(Debug, Clone)]
pub struct ReorganizerConfig {
    /// Clusters at or below this size are summarized in one shot
    pub local_tree_threshold: usize,

    /// Smallest cluster kept as its own group
    pub min_cluster_size: usize,

    /// A pass is skipped when fewer candidates than this are found
    pub min_group_size: usize,

    /// Neighbors considered per node by the relation reasoner
    pub relation_top_k: usize,

    /// Number of most frequent tags that seed tag groups
    pub frequent_tag_top_n: usize,

    /// Any tag seen at least this often also seeds a tag group
    pub frequent_tag_min_count: usize,

    /// Upper bound on k for embedding clustering
    pub max_clusters: usize,

    pub kmeans_max_iterations: usize,

    /// Seed for k-means++ initialisation, fixed so passes are reproducible
    pub kmeans_seed: u64,
}

impl Default for ReorganizerConfig {
    fn default() -> Self {
        Self {
            local_tree_threshold: 10,
            min_cluster_size: 3,
            min_group_size: 10,
            relation_top_k: 10,
            frequent_tag_top_n: 50,
            frequent_tag_min_count: 50,
            max_clusters: 20,
            kmeans_max_iterations: 100,
            kmeans_seed: 42,
        }
    }
}

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    pub vector_backend: VectorBackend,

    pub snapshot_backend: SnapshotBackend,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Minimum cosine similarity for an existing node to count as similar on write
    pub similar_threshold: f32,

    /// Similarity at which an incoming memory is merged instead of inserted
    pub merge_threshold: f32,

    /// How many existing nodes are compared against each incoming memory
    pub merge_candidates: usize,

    pub working_capacity: usize,
    pub long_term_capacity: usize,
    pub user_capacity: usize,

    /// Depth bound for the PARENT expansion done by search
    pub max_expand_depth: usize,

    /// Default number of vector hits for search
    pub max_retrieval_results: usize,

    /// Upper bound on a single oracle round-trip
    pub oracle_timeout: Duration,

    /// OpenAI-compatible endpoint used by the HTTP oracle
    pub oracle_base_url: String,

    pub oracle_model: String,

    /// Environment variable holding the oracle API key
    pub oracle_api_key_env: String,

    pub reorganizer: ReorganizerConfig,

    /// HTTP server port
    pub server_port: u16,

    /// How often the server schedules reorganizer passes; `None` disables it
    pub reorganize_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata-memory");

        Self {
            data_dir,
            vector_backend: VectorBackend::Lance,
            snapshot_backend: SnapshotBackend::Sqlite,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            similar_threshold: 0.8,
            merge_threshold: 0.9,
            merge_candidates: 5,
            working_capacity: 20,
            long_term_capacity: 500,
            user_capacity: 500,
            max_expand_depth: 8,
            max_retrieval_results: 10,
            oracle_timeout: Duration::from_secs(30),
            oracle_base_url: "http://127.0.0.1:11434".to_string(),
            oracle_model: "qwen2.5:7b-instruct".to_string(),
            oracle_api_key_env: "STRATA_ORACLE_API_KEY".to_string(),
            reorganizer: ReorganizerConfig::default(),
            server_port: 8421,
            reorganize_interval: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Nominal capacity of a tier
    pub fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::Working => self.working_capacity,
            Tier::LongTerm => self.long_term_capacity,
            Tier::User => self.user_capacity,
        }
    }

    /// Get the path to the SQLite snapshot database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("graphs.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Get the directory holding JSONL snapshots
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("graphs")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.snapshot_dir())?;
        std::fs::create_dir_all(self.vector_db_path())?;
        Ok(())
    }
}
