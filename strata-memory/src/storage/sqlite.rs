//! SQLite storage for per-owner graph snapshots

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{MemoryEdge, MemoryNode};
use crate::storage::{GraphSnapshot, SnapshotStore};

/// SQLite snapshot backend
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    /// Open the database configured in `config`
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(config.sqlite_path())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Owners that have a saved snapshot
    pub fn owners(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let mut stmt = conn.prepare("SELECT owner_id FROM graph_snapshots ORDER BY owner_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let tx = conn.transaction()?;
        let owner = snapshot.owner_id.as_str();

        tx.execute("DELETE FROM graph_nodes WHERE owner_id = ?1", params![owner])?;
        tx.execute("DELETE FROM graph_edges WHERE owner_id = ?1", params![owner])?;

        {
            let mut insert_node = tx.prepare(
                r#"
                INSERT INTO graph_nodes (owner_id, id, tier, status, body, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for node in &snapshot.nodes {
                // The vector goes into its own column as little-endian f32s
                let embedding_blob = node
                    .embedding
                    .as_ref()
                    .map(|e| e.iter().flat_map(|f| f.to_le_bytes()).collect::<Vec<u8>>());
                let mut body = node.clone();
                body.embedding = None;

                insert_node.execute(params![
                    owner,
                    node.id.to_string(),
                    node.tier.to_string(),
                    node.status.to_string(),
                    serde_json::to_string(&body)?,
                    embedding_blob,
                ])?;
            }

            let mut insert_edge = tx.prepare(
                r#"
                INSERT INTO graph_edges (owner_id, id, from_id, to_id, edge_type, weight, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for edge in &snapshot.edges {
                insert_edge.execute(params![
                    owner,
                    edge.id.to_string(),
                    edge.from.to_string(),
                    edge.to.to_string(),
                    edge.edge_type.to_string(),
                    edge.weight,
                    edge.created_at.to_rfc3339(),
                ])?;
            }
        }

        tx.execute(
            r#"
            INSERT INTO graph_snapshots (owner_id, saved_at, node_count, edge_count)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(owner_id) DO UPDATE SET
                saved_at = excluded.saved_at,
                node_count = excluded.node_count,
                edge_count = excluded.edge_count
            "#,
            params![
                owner,
                snapshot.saved_at.to_rfc3339(),
                snapshot.nodes.len() as i64,
                snapshot.edges.len() as i64,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load(&self, owner_id: &str) -> Result<Option<GraphSnapshot>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let saved_at: Option<String> = conn
            .query_row(
                "SELECT saved_at FROM graph_snapshots WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(saved_at) = saved_at else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT body, embedding FROM graph_nodes WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], |row| {
            Ok(NodeRow {
                body: row.get(0)?,
                embedding: row.get(1)?,
            })
        })?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?.into_node()?);
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT id, from_id, to_id, edge_type, weight, created_at
            FROM graph_edges WHERE owner_id = ?1
            "#,
        )?;
        let rows = stmt.query_map(params![owner_id], |row| {
            Ok(EdgeRow {
                id: row.get(0)?,
                from_id: row.get(1)?,
                to_id: row.get(2)?,
                edge_type: row.get(3)?,
                weight: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?.into_edge()?);
        }

        Ok(Some(GraphSnapshot {
            owner_id: owner_id.to_string(),
            saved_at: parse_time(&saved_at)?,
            nodes,
            edges,
        }))
    }
}

fn parse_time(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::storage(e.to_string()))
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::storage(e.to_string()))
}

/// Intermediate struct for reading from SQLite
struct NodeRow {
    body: String,
    embedding: Option<Vec<u8>>,
}

impl NodeRow {
    fn into_node(self) -> Result<MemoryNode> {
        let mut node: MemoryNode = serde_json::from_str(&self.body)?;
        node.embedding = self.embedding.map(|blob| {
            blob.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        });
        Ok(node)
    }
}

struct EdgeRow {
    id: String,
    from_id: String,
    to_id: String,
    edge_type: String,
    weight: u32,
    created_at: String,
}

impl EdgeRow {
    fn into_edge(self) -> Result<MemoryEdge> {
        Ok(MemoryEdge {
            id: parse_id(&self.id)?,
            from: parse_id(&self.from_id)?,
            to: parse_id(&self.to_id)?,
            edge_type: self.edge_type.parse()?,
            weight: self.weight,
            created_at: parse_time(&self.created_at)?,
        })
    }
}
