//! JSONL storage for per-owner graph snapshots

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{MemoryEdge, MemoryNode};
use crate::storage::{GraphSnapshot, SnapshotStore};

/// One line of a snapshot file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum SnapshotRecord {
    Header {
        owner_id: String,
        saved_at: DateTime<Utc>,
    },
    Node(MemoryNode),
    Edge(MemoryEdge),
}

/// JSONL snapshot backend, one file per owner
pub struct JsonlSnapshotStore {
    base_path: PathBuf,
}

impl JsonlSnapshotStore {
    /// Create a new JSONL store under the configured snapshot directory
    pub fn new(config: &Config) -> Result<Self> {
        Self::at(config.snapshot_dir())
    }

    pub fn at(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        Ok(Self { base_path })
    }

    fn snapshot_path(&self, owner_id: &str) -> Result<PathBuf> {
        if owner_id.is_empty()
            || owner_id.contains(['/', '\\'])
            || owner_id.starts_with('.')
        {
            return Err(Error::invalid_input(format!(
                "Owner id cannot be used as a file name: {:?}",
                owner_id
            )));
        }
        Ok(self.base_path.join(format!("{}.jsonl", owner_id)))
    }

    /// List all owners with a snapshot file
    pub fn list_owners(&self) -> Result<Vec<String>> {
        let mut owners = Vec::new();
        for entry in std::fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    owners.push(stem.to_string_lossy().to_string());
                }
            }
        }
        owners.sort();
        Ok(owners)
    }
}

impl SnapshotStore for JsonlSnapshotStore {
    fn save(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.owner_id)?;
        let tmp_path = path.with_extension("jsonl.tmp");

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            let header = SnapshotRecord::Header {
                owner_id: snapshot.owner_id.clone(),
                saved_at: snapshot.saved_at,
            };
            writeln!(writer, "{}", serde_json::to_string(&header)?)?;
            for node in &snapshot.nodes {
                let line = serde_json::to_string(&SnapshotRecord::Node(node.clone()))?;
                writeln!(writer, "{}", line)?;
            }
            for edge in &snapshot.edges {
                let line = serde_json::to_string(&SnapshotRecord::Edge(edge.clone()))?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
        }

        // Readers never see a half-written snapshot
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load(&self, owner_id: &str) -> Result<Option<GraphSnapshot>> {
        let path = self.snapshot_path(owner_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut snapshot = GraphSnapshot::new(owner_id, Vec::new(), Vec::new());

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SnapshotRecord>(&line)? {
                SnapshotRecord::Header { owner_id: stored, saved_at } => {
                    if stored != owner_id {
                        return Err(Error::storage(format!(
                            "Snapshot {:?} belongs to owner {}",
                            path, stored
                        )));
                    }
                    snapshot.saved_at = saved_at;
                }
                SnapshotRecord::Node(node) => snapshot.nodes.push(node),
                SnapshotRecord::Edge(edge) => snapshot.edges.push(edge),
            }
        }

        Ok(Some(snapshot))
    }
}
