//! Vector indexes for similarity search over node embeddings

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::node::{MemoryNode, NodeStatus, NodeType, Tier};

const TABLE_NAME: &str = "memory_nodes";

/// Searchable metadata mirrored next to each vector
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMetadata {
    pub owner_id: String,
    pub session_id: Option<String>,
    pub tier: Tier,
    pub status: NodeStatus,
    pub node_type: NodeType,
}

impl VectorMetadata {
    pub fn of(node: &MemoryNode) -> Self {
        Self {
            owner_id: node.owner_id.clone(),
            session_id: node.session_id.clone(),
            tier: node.tier,
            status: node.status,
            node_type: node.node_type,
        }
    }

    fn value(&self, field: MetadataField) -> Option<&str> {
        match field {
            MetadataField::OwnerId => Some(&self.owner_id),
            MetadataField::SessionId => self.session_id.as_deref(),
            MetadataField::Tier => Some(self.tier.as_str()),
            MetadataField::Status => Some(self.status.as_str()),
            MetadataField::NodeType => Some(self.node_type.as_str()),
        }
    }
}

/// Metadata columns a filter can test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    OwnerId,
    SessionId,
    Tier,
    Status,
    NodeType,
}

impl MetadataField {
    fn column(&self) -> &'static str {
        match self {
            MetadataField::OwnerId => "owner_id",
            MetadataField::SessionId => "session_id",
            MetadataField::Tier => "tier",
            MetadataField::Status => "status",
            MetadataField::NodeType => "node_type",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterClause {
    Eq(MetadataField, String),
    In(MetadataField, Vec<String>),
}

/// Conjunction of equality and set-membership clauses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    clauses: Vec<FilterClause>,
}

impl VectorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: MetadataField, value: impl Into<String>) -> Self {
        self.clauses.push(FilterClause::Eq(field, value.into()));
        self
    }

    pub fn one_of<I, S>(mut self, field: MetadataField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clauses
            .push(FilterClause::In(field, values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn owner(self, owner_id: &str) -> Self {
        self.eq(MetadataField::OwnerId, owner_id)
    }

    pub fn activated(self) -> Self {
        self.eq(MetadataField::Status, NodeStatus::Activated.as_str())
    }

    pub fn tiers(self, tiers: &[Tier]) -> Self {
        self.one_of(MetadataField::Tier, tiers.iter().map(|t| t.as_str()))
    }

    pub fn matches(&self, metadata: &VectorMetadata) -> bool {
        self.clauses.iter().all(|clause| match clause {
            FilterClause::Eq(field, value) => metadata.value(*field) == Some(value.as_str()),
            FilterClause::In(field, values) => metadata
                .value(*field)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
        })
    }

    /// Render as a SQL predicate; `None` when there is nothing to filter on
    pub fn to_sql(&self) -> Option<String> {
        if self.clauses.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| match clause {
                FilterClause::Eq(field, value) => {
                    format!("{} = '{}'", field.column(), escape(value))
                }
                FilterClause::In(_, values) if values.is_empty() => "1 = 0".to_string(),
                FilterClause::In(field, values) => {
                    let list: Vec<String> =
                        values.iter().map(|v| format!("'{}'", escape(v))).collect();
                    format!("{} IN ({})", field.column(), list.join(", "))
                }
            })
            .collect();
        Some(parts.join(" AND "))
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Result from a vector similarity search
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: Uuid,
    /// Cosine similarity, higher is closer
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Similarity-searchable mirror of node embeddings
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector and metadata stored for `id`
    async fn upsert(&self, id: Uuid, vector: &[f32], metadata: VectorMetadata) -> Result<()>;

    /// Drop whatever is stored for `id`; a missing entry is not an error
    async fn remove(&self, id: Uuid) -> Result<()>;

    /// Up to `k` entries passing `filter`, best first
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<SearchResult>>;
}

/// Brute-force cosine index kept in process memory
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<Uuid, (Vec<f32>, VectorMetadata)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metadata(&self, id: Uuid) -> Option<VectorMetadata> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&id).map(|(_, m)| m.clone()))
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: Uuid, vector: &[f32], metadata: VectorMetadata) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| Error::vector_db(e.to_string()))?;
        entries.insert(id, (vector.to_vec(), metadata));
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.entries
            .write()
            .map_err(|e| Error::vector_db(e.to_string()))?
            .remove(&id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<SearchResult>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let mut results: Vec<SearchResult> = entries
            .iter()
            .filter(|(_, (_, metadata))| filter.matches(metadata))
            .map(|(id, (stored, metadata))| SearchResult {
                id: *id,
                score: cosine_similarity(vector, stored),
                metadata: metadata.clone(),
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);
        Ok(results)
    }
}

/// Vector storage backend using LanceDB
pub struct LanceVectorIndex {
    db: lancedb::Connection,
    dimensions: usize,
}

impl LanceVectorIndex {
    /// Open (or create) the node table under the configured vector directory
    pub async fn new(config: &Config) -> Result<Self> {
        let path = config.vector_db_path();
        let uri = path
            .to_str()
            .ok_or_else(|| Error::config(format!("Vector path is not UTF-8: {:?}", path)))?;
        let db = connect(uri)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let storage = Self {
            db,
            dimensions: config.embedding_dimensions,
        };

        storage.ensure_table().await?;

        Ok(storage)
    }

    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("owner_id", DataType::Utf8, false),
            Field::new("session_id", DataType::Utf8, true),
            Field::new("tier", DataType::Utf8, false),
            Field::new("status", DataType::Utf8, false),
            Field::new("node_type", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(|e| Error::vector_db(e.to_string()))?;
        }

        Ok(())
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))
    }

    fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
        batch
            .column_by_name(name)
            .ok_or_else(|| Error::vector_db(format!("Missing {} column", name)))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| Error::vector_db(format!("{} column is not StringArray", name)))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn upsert(&self, id: Uuid, vector: &[f32], metadata: VectorMetadata) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::vector_db(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        let table = self.table().await?;

        // Replace any existing row for this node
        table
            .delete(&format!("id = '{}'", id))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let values = Float32Array::from(vector.to_vec());
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        let schema = Arc::new(self.schema());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![id.to_string()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![metadata.owner_id.clone()])),
                Arc::new(StringArray::from(vec![metadata.session_id.clone()])),
                Arc::new(StringArray::from(vec![metadata.tier.to_string()])),
                Arc::new(StringArray::from(vec![metadata.status.to_string()])),
                Arc::new(StringArray::from(vec![metadata.node_type.to_string()])),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))?;

        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let table = self.table().await?;
        table
            .delete(&format!("id = '{}'", id))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<SearchResult>> {
        let table = self.table().await?;

        let mut query = table
            .vector_search(vector.to_vec())
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .distance_type(DistanceType::Cosine)
            .limit(k);

        if let Some(predicate) = filter.to_sql() {
            query = query.only_if(predicate);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut results = Vec::new();
        for batch in batches {
            let ids = Self::string_column(&batch, "id")?;
            let owners = Self::string_column(&batch, "owner_id")?;
            let sessions = Self::string_column(&batch, "session_id")?;
            let tiers = Self::string_column(&batch, "tier")?;
            let statuses = Self::string_column(&batch, "status")?;
            let types = Self::string_column(&batch, "node_type")?;
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| Error::vector_db("Missing _distance column"))?
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| Error::vector_db("_distance column is not Float32Array"))?;

            for i in 0..batch.num_rows() {
                results.push(SearchResult {
                    id: Uuid::parse_str(ids.value(i))
                        .map_err(|e| Error::vector_db(e.to_string()))?,
                    // Cosine distance is 1 - similarity
                    score: 1.0 - distances.value(i),
                    metadata: VectorMetadata {
                        owner_id: owners.value(i).to_string(),
                        session_id: (!sessions.is_null(i))
                            .then(|| sessions.value(i).to_string()),
                        tier: tiers.value(i).parse()?,
                        status: statuses.value(i).parse()?,
                        node_type: types.value(i).parse()?,
                    },
                });
            }
        }

        Ok(results)
    }
}
