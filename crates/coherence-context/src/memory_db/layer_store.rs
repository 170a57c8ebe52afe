//! Hierarchical layer embeddings addressed by positional index
use crate::memory_db::schema::{LayerEmbedding, ScoredLayer};
use crate::memory_db::{
    cosine_similarity, decode_embedding, encode_embedding, prefix_upper_bound, SimilarityMode,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, warn};

const LAYER_COLUMNS: &str = "positional_index, layer, project_id, chart_id, node_id, content, \
                             embedding, parent_index, child_indices, created_at";

pub struct LayerStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    mode: SimilarityMode,
}

impl LayerStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, mode: SimilarityMode) -> Self {
        Self { pool, mode }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn upsert(&self, entry: &LayerEmbedding) -> anyhow::Result<()> {
        self.upsert_many(std::slice::from_ref(entry))
    }

    pub fn upsert_many(&self, entries: &[LayerEmbedding]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO layer_embeddings
                 (positional_index, layer, project_id, chart_id, node_id, content,
                  embedding, parent_index, child_indices, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for entry in entries {
                let embedding = entry.embedding.as_deref().map(encode_embedding).transpose()?;
                stmt.execute(params![
                    &entry.positional_index,
                    entry.layer as i64,
                    entry.project_id,
                    entry.chart_id,
                    entry.node_id,
                    &entry.content,
                    embedding,
                    &entry.parent_index,
                    serde_json::to_string(&entry.child_indices)?,
                    entry.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} layer entries", entries.len());
        Ok(())
    }

    pub fn get(&self, positional_index: &str) -> anyhow::Result<Option<LayerEmbedding>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM layer_embeddings WHERE positional_index = ?1",
            LAYER_COLUMNS
        ))?;
        let entry = stmt
            .query_row([positional_index], |row| Ok(row_to_layer(row)))
            .optional()?;
        entry.transpose()
    }

    /// Every entry whose index starts with `prefix`, in index order
    pub fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<LayerEmbedding>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM layer_embeddings
             WHERE positional_index >= ?1 AND positional_index < ?2
             ORDER BY positional_index",
            LAYER_COLUMNS
        ))?;
        let mut rows = stmt.query(params![prefix, prefix_upper_bound(prefix)])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_layer(row)?);
        }
        Ok(entries)
    }

    pub fn count_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM layer_embeddings WHERE positional_index >= ?1 AND positional_index < ?2",
            params![prefix, prefix_upper_bound(prefix)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM layer_embeddings WHERE positional_index >= ?1 AND positional_index < ?2",
            params![prefix, prefix_upper_bound(prefix)],
        )?;
        debug!("Deleted {} layer entries under '{}'", deleted, prefix);
        Ok(deleted)
    }

    /// Rank entries of one layer under `prefix` by similarity to `query`.
    ///
    /// Degrades like memory search: an unavailable capability yields nothing.
    pub fn search_prefix(
        &self,
        prefix: &str,
        layer: u8,
        query: &[f32],
        k: usize,
    ) -> Vec<ScoredLayer> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let result = match self.mode {
            SimilarityMode::Disabled => {
                warn!("Layer similarity search unavailable (capability disabled)");
                return Vec::new();
            }
            SimilarityMode::Native => self
                .search_native(prefix, layer, query, k)
                .or_else(|e| {
                    warn!("Native layer search failed ({}), falling back to exact scan", e);
                    self.search_exact(prefix, layer, query, k)
                }),
            SimilarityMode::Exact => self.search_exact(prefix, layer, query, k),
        };
        result.unwrap_or_else(|e| {
            warn!("Layer search degraded, returning no entries: {}", e);
            Vec::new()
        })
    }

    fn search_native(
        &self,
        prefix: &str,
        layer: u8,
        query: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<ScoredLayer>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {}, cosine_sim(embedding, ?) AS score FROM layer_embeddings
             WHERE embedding IS NOT NULL AND layer = ?
               AND positional_index >= ? AND positional_index < ?
             ORDER BY score DESC LIMIT ?",
            LAYER_COLUMNS
        );
        let values = [
            Value::Blob(encode_embedding(query)?),
            Value::Integer(layer as i64),
            Value::Text(prefix.to_string()),
            Value::Text(prefix_upper_bound(prefix)),
            Value::Integer(k as i64),
        ];
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let score: f64 = row.get(10)?;
            results.push(ScoredLayer {
                entry: row_to_layer(row)?,
                score: score as f32,
            });
        }
        Ok(results)
    }

    fn search_exact(
        &self,
        prefix: &str,
        layer: u8,
        query: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<ScoredLayer>> {
        let mut results: Vec<ScoredLayer> = self
            .list_prefix(prefix)?
            .into_iter()
            .filter(|e| e.layer == layer)
            .filter_map(|entry| {
                let score = cosine_similarity(query, entry.embedding.as_deref()?);
                Some(ScoredLayer { entry, score })
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }
}

fn row_to_layer(row: &Row) -> anyhow::Result<LayerEmbedding> {
    let layer: i64 = row.get(1)?;
    let embedding: Option<Vec<u8>> = row.get(6)?;
    let child_indices: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(LayerEmbedding {
        positional_index: row.get(0)?,
        layer: layer as u8,
        project_id: row.get(2)?,
        chart_id: row.get(3)?,
        node_id: row.get(4)?,
        content: row.get(5)?,
        embedding: embedding.as_deref().map(decode_embedding).transpose()?,
        parent_index: row.get(7)?,
        child_indices: serde_json::from_str(&child_indices)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
            .with_timezone(&chrono::Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;
    use chrono::Utc;

    fn entry(index: &str, layer: u8, embedding: Vec<f32>) -> LayerEmbedding {
        LayerEmbedding {
            positional_index: index.to_string(),
            layer,
            project_id: 1,
            chart_id: Some(2),
            node_id: None,
            content: format!("content of {}", index),
            embedding: Some(embedding),
            parent_index: None,
            child_indices: vec![],
            created_at: Utc::now(),
        }
    }

    fn seeded(mode: SimilarityMode) -> MemoryDatabase {
        let db = MemoryDatabase::new_in_memory(mode).unwrap();
        db.layers
            .upsert_many(&[
                entry("L3.1.2.aaaa", 3, vec![1.0, 0.0]),
                entry("L3.1.2.bbbb", 3, vec![0.0, 1.0]),
                entry("L3.1.3.aaaa", 3, vec![1.0, 0.0]),
                entry("L4.1.2.aaaa.7", 4, vec![1.0, 0.0]),
            ])
            .unwrap();
        db
    }

    #[test]
    fn test_prefix_scan_matches_only_prefix() {
        let db = seeded(SimilarityMode::Native);
        let listed = db.layers.list_prefix("L3.1.2.").unwrap();
        let indices: Vec<&str> = listed.iter().map(|e| e.positional_index.as_str()).collect();
        assert_eq!(indices, vec!["L3.1.2.aaaa", "L3.1.2.bbbb"]);
        assert_eq!(db.layers.count_prefix("L3.1.").unwrap(), 3);
    }

    #[test]
    fn test_search_prefix_ranks_within_layer() {
        for mode in [SimilarityMode::Native, SimilarityMode::Exact] {
            let db = seeded(mode);
            let hits = db.layers.search_prefix("L3.1.2.", 3, &[0.1, 1.0], 5);
            assert_eq!(hits.len(), 2, "mode {}", mode);
            assert_eq!(hits[0].entry.positional_index, "L3.1.2.bbbb");
        }
    }

    #[test]
    fn test_delete_prefix_and_roundtrip_fields() {
        let db = seeded(SimilarityMode::Exact);
        let mut parent = entry("L2.1.2", 2, vec![0.5, 0.5]);
        parent.child_indices = vec!["L3.1.2.aaaa".into(), "L3.1.2.bbbb".into()];
        parent.parent_index = Some("L1.1".into());
        db.layers.upsert(&parent).unwrap();

        let stored = db.layers.get("L2.1.2").unwrap().unwrap();
        assert_eq!(stored.child_indices.len(), 2);
        assert_eq!(stored.parent_index.as_deref(), Some("L1.1"));

        assert_eq!(db.layers.delete_prefix("L3.1.2.").unwrap(), 2);
        assert!(db.layers.get("L3.1.2.aaaa").unwrap().is_none());
        assert!(db.layers.get("L3.1.3.aaaa").unwrap().is_some());
    }

    #[test]
    fn test_disabled_mode_search_is_empty() {
        let db = seeded(SimilarityMode::Disabled);
        assert!(db.layers.search_prefix("L3.", 3, &[1.0, 0.0], 5).is_empty());
    }
}
