
//! Database schema definitions for the memory system
use crate::graph::{ChartId, NodeId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of content held by a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Triple,
    Fact,
    Chunk,
    Summary,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Triple,
        MemoryKind::Fact,
        MemoryKind::Chunk,
        MemoryKind::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Triple => "triple",
            MemoryKind::Fact => "fact",
            MemoryKind::Chunk => "chunk",
            MemoryKind::Summary => "summary",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triple" => Ok(MemoryKind::Triple),
            "fact" => Ok(MemoryKind::Fact),
            "chunk" => Ok(MemoryKind::Chunk),
            "summary" => Ok(MemoryKind::Summary),
            other => Err(anyhow::anyhow!("Unknown memory kind: {}", other)),
        }
    }
}

/// One row of the vector memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Stable content hash of (owner, collection, kind, content)
    pub id: String,
    pub owner_node_id: NodeId,
    pub owner_collection_id: ChartId,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        owner_node_id: NodeId,
        owner_collection_id: ChartId,
        kind: MemoryKind,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: Self::content_id(owner_node_id, owner_collection_id, kind, &content),
            owner_node_id,
            owner_collection_id,
            kind,
            content,
            embedding: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Identical (owner, collection, kind, content) always maps to the same id.
    pub fn content_id(
        owner_node_id: NodeId,
        owner_collection_id: ChartId,
        kind: MemoryKind,
        content: &str,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&owner_node_id.to_le_bytes());
        hasher.update(&owner_collection_id.to_le_bytes());
        hasher.update(kind.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(content.trim().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Memory record with its similarity to a query
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Last processed state of a node within a chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub node_id: NodeId,
    pub chart_id: ChartId,
    pub content_hash: String,
    pub triple_count: usize,
    pub fact_count: usize,
    pub embedding_count: usize,
    pub processed_at: DateTime<Utc>,
}

/// Hierarchical layer entry keyed by positional index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerEmbedding {
    pub positional_index: String,
    pub layer: u8,
    pub project_id: ProjectId,
    pub chart_id: Option<ChartId>,
    pub node_id: Option<NodeId>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub parent_index: Option<String>,
    pub child_indices: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredLayer {
    pub entry: LayerEmbedding,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub total_processed: i64,
    pub total_layers: i64,
    pub database_size_bytes: i64,
}

pub const SCHEMA_SQL: &str = "
-- Vector memory records
CREATE TABLE IF NOT EXISTS memory_records (
    id TEXT PRIMARY KEY,
    owner_node_id INTEGER NOT NULL,
    owner_collection_id INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('triple', 'fact', 'chunk', 'summary')),
    content TEXT NOT NULL,
    embedding BLOB,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TIMESTAMP NOT NULL
);
-- Change detection state
CREATE TABLE IF NOT EXISTS processing_state (
    node_id INTEGER NOT NULL,
    chart_id INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    triple_count INTEGER NOT NULL DEFAULT 0,
    fact_count INTEGER NOT NULL DEFAULT 0,
    embedding_count INTEGER NOT NULL DEFAULT 0,
    processed_at TIMESTAMP NOT NULL,
    PRIMARY KEY (node_id, chart_id)
);
-- Hierarchical layer embeddings
CREATE TABLE IF NOT EXISTS layer_embeddings (
    positional_index TEXT PRIMARY KEY,
    layer INTEGER NOT NULL CHECK (layer BETWEEN 1 AND 4),
    project_id INTEGER NOT NULL,
    chart_id INTEGER,
    node_id INTEGER,
    content TEXT NOT NULL,
    embedding BLOB,
    parent_index TEXT,
    child_indices TEXT NOT NULL DEFAULT '[]',
    created_at TIMESTAMP NOT NULL
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_memory_owner ON memory_records (owner_node_id, owner_collection_id, kind);
CREATE INDEX IF NOT EXISTS idx_memory_collection ON memory_records (owner_collection_id, kind);
CREATE INDEX IF NOT EXISTS idx_processing_chart ON processing_state (chart_id);
CREATE INDEX IF NOT EXISTS idx_layer_by_layer ON layer_embeddings (layer, positional_index);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_is_stable_and_scoped() {
        let a = MemoryRecord::content_id(1, 2, MemoryKind::Fact, "The bridge collapses");
        let b = MemoryRecord::content_id(1, 2, MemoryKind::Fact, "  The bridge collapses ");
        let other_owner = MemoryRecord::content_id(3, 2, MemoryKind::Fact, "The bridge collapses");
        let other_kind = MemoryRecord::content_id(1, 2, MemoryKind::Summary, "The bridge collapses");
        assert_eq!(a, b);
        assert_ne!(a, other_owner);
        assert_ne!(a, other_kind);
    }

    #[test]
    fn test_memory_kind_parse() {
        for kind in MemoryKind::ALL {
            assert_eq!(kind.as_str().parse::<MemoryKind>().unwrap(), kind);
        }
        assert!("vector".parse::<MemoryKind>().is_err());
    }
}
