//! # Strata Memory
//!
//! Long-lived, tiered memory for conversational agents.
//!
//! ## Architecture
//!
//! - **Graph index** - arena of nodes plus typed edges; the PARENT edges form
//!   a summary hierarchy, every other edge type is a free relation
//! - **Tiered memory** - Working (raw log), LongTerm and User tiers; writes
//!   merge near-duplicates instead of piling them up
//! - **Reorganizer** - periodic per-tier pass that clusters loose nodes and
//!   writes topic summaries above them
//! - **Relation reasoner** - causal, conditional, conflicting and sequential
//!   links between tag neighbors, plus inferred and aggregate nodes
//!
//! Language-model decisions go through the [`oracle::SemanticOracle`] trait.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_memory::{Config, Reorganizer, TieredMemory, HttpOracle};
//!
//! let config = Config::default();
//! let memory = TieredMemory::open(config.clone()).await?;
//!
//! // Store extracted memories
//! memory.add(vec![node]).await?;
//!
//! // Retrieve a rendered subgraph for a query
//! let context = memory.search("where does alice live", 5, "user-1").await?;
//!
//! // Consolidate a tier
//! let reorganizer = Reorganizer::for_memory(&memory, Arc::new(HttpOracle::new(&config)?));
//! reorganizer.run(Tier::LongTerm).await?;
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod memory;
pub mod node;
pub mod oracle;
pub mod reasoner;
pub mod reorganizer;
pub mod retrieval;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};
pub use graph::GraphIndex;
pub use memory::{AddOutcome, Ingested, TieredMemory};
pub use node::{EdgeType, MemoryEdge, MemoryNode, NodeStatus, NodeType, Tier};
pub use oracle::{HttpOracle, SemanticOracle};
pub use reasoner::RelationReasoner;
pub use reorganizer::{ReorganizeOutcome, ReorganizeReport, Reorganizer};
pub use retrieval::RetrievalContext;
