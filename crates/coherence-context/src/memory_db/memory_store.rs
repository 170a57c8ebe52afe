
//! Vector memory records: idempotent storage and filtered similarity search
use crate::graph::{ChartId, NodeId};
use crate::memory_db::schema::*;
use crate::memory_db::{cosine_similarity, decode_embedding, encode_embedding, SimilarityMode};
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Row};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Predicate pushed into every search and listing query
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Restrict to these owners; empty means any owner
    pub owner_node_ids: Vec<NodeId>,
    pub collection_id: Option<ChartId>,
    /// Restrict to these kinds; empty means any kind
    pub kinds: Vec<MemoryKind>,
}

impl SearchFilters {
    pub fn for_collection(collection_id: ChartId) -> Self {
        Self {
            collection_id: Some(collection_id),
            ..Default::default()
        }
    }

    pub fn owners(mut self, owners: impl IntoIterator<Item = NodeId>) -> Self {
        self.owner_node_ids = owners.into_iter().collect();
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = MemoryKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Appends `AND ...` clauses and their bound values in order.
    fn push_clauses(&self, sql: &mut String, values: &mut Vec<Value>) {
        if !self.owner_node_ids.is_empty() {
            let placeholders = vec!["?"; self.owner_node_ids.len()].join(",");
            sql.push_str(&format!(" AND owner_node_id IN ({})", placeholders));
            values.extend(self.owner_node_ids.iter().map(|id| Value::Integer(*id)));
        }
        if let Some(collection) = self.collection_id {
            sql.push_str(" AND owner_collection_id = ?");
            values.push(Value::Integer(collection));
        }
        if !self.kinds.is_empty() {
            let placeholders = vec!["?"; self.kinds.len()].join(",");
            sql.push_str(&format!(" AND kind IN ({})", placeholders));
            values.extend(self.kinds.iter().map(|k| Value::Text(k.as_str().to_string())));
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryStats {
    pub total_records: usize,
    pub embedded_records: usize,
    pub triples: usize,
    pub facts: usize,
    pub chunks: usize,
    pub summaries: usize,
    pub similarity_mode: SimilarityMode,
}

const RECORD_COLUMNS: &str =
    "id, owner_node_id, owner_collection_id, kind, content, embedding, metadata, created_at";

pub struct MemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    mode: SimilarityMode,
    /// Writes for one owner never interleave
    owner_locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, mode: SimilarityMode) -> Self {
        Self {
            pool,
            mode,
            owner_locks: DashMap::new(),
        }
    }

    pub fn mode(&self) -> SimilarityMode {
        self.mode
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    fn owner_lock(&self, owner: NodeId) -> Arc<Mutex<()>> {
        self.owner_locks
            .entry(owner)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert a record, or fill in its embedding if the same content is already
    /// stored without one. Returns `true` when a new row was created.
    pub fn store(&self, record: &MemoryRecord) -> anyhow::Result<bool> {
        let lock = self.owner_lock(record.owner_node_id);
        let _guard = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Owner write lock poisoned for node {}", record.owner_node_id))?;
        let conn = self.get_conn()?;
        Self::store_with(&conn, record)
    }

    /// Store many records in one transaction. Returns the number of new rows.
    pub fn store_many(&self, records: &[MemoryRecord]) -> anyhow::Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut owners: Vec<NodeId> = records.iter().map(|r| r.owner_node_id).collect();
        owners.sort_unstable();
        owners.dedup();
        let locks: Vec<Arc<Mutex<()>>> = owners.iter().map(|o| self.owner_lock(*o)).collect();
        let _guards = locks
            .iter()
            .map(|l| l.lock().map_err(|_| anyhow::anyhow!("Owner write lock poisoned")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for record in records {
            if Self::store_with(&tx, record)? {
                inserted += 1;
            }
        }
        tx.commit()?;
        debug!("Stored {} memory records ({} new)", records.len(), inserted);
        Ok(inserted)
    }

    fn store_with(conn: &rusqlite::Connection, record: &MemoryRecord) -> anyhow::Result<bool> {
        let embedding_bytes = record
            .embedding
            .as_deref()
            .map(encode_embedding)
            .transpose()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO memory_records
             (id, owner_node_id, owner_collection_id, kind, content, embedding, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &record.id,
                record.owner_node_id,
                record.owner_collection_id,
                record.kind.as_str(),
                &record.content,
                embedding_bytes,
                serde_json::to_string(&record.metadata)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            if let Some(bytes) = embedding_bytes {
                conn.execute(
                    "UPDATE memory_records SET embedding = ?2 WHERE id = ?1 AND embedding IS NULL",
                    params![&record.id, bytes],
                )?;
            }
        }
        Ok(inserted > 0)
    }

    /// Nearest neighbours of `query` among records matching `filters`.
    ///
    /// Never fails: an unavailable or failing similarity capability yields an
    /// empty list, which callers treat as "no prior memory".
    pub fn search_similar(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Vec<ScoredMemory> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        match self.mode {
            SimilarityMode::Disabled => {
                warn!("Similarity search unavailable (capability disabled); returning no memories");
                Vec::new()
            }
            SimilarityMode::Native => match self.search_native(query, k, filters) {
                Ok(results) => results,
                Err(e) => {
                    warn!("Native similarity search failed ({}), falling back to exact scan", e);
                    self.search_exact_or_empty(query, k, filters)
                }
            },
            SimilarityMode::Exact => self.search_exact_or_empty(query, k, filters),
        }
    }

    fn search_exact_or_empty(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Vec<ScoredMemory> {
        match self.search_exact(query, k, filters) {
            Ok(results) => results,
            Err(e) => {
                warn!("Similarity search degraded, returning no memories: {}", e);
                Vec::new()
            }
        }
    }

    fn search_native(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<ScoredMemory>> {
        let conn = self.get_conn()?;
        let mut sql = format!(
            "SELECT {}, cosine_sim(embedding, ?) AS score FROM memory_records WHERE embedding IS NOT NULL",
            RECORD_COLUMNS
        );
        let mut values = vec![Value::Blob(encode_embedding(query)?)];
        filters.push_clauses(&mut sql, &mut values);
        sql.push_str(" ORDER BY score DESC LIMIT ?");
        values.push(Value::Integer(k as i64));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let score: f64 = row.get(8)?;
            results.push(ScoredMemory {
                record: row_to_record(row)?,
                score: score as f32,
            });
        }
        Ok(results)
    }

    fn search_exact(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<ScoredMemory>> {
        let conn = self.get_conn()?;
        let mut sql = format!(
            "SELECT {} FROM memory_records WHERE embedding IS NOT NULL",
            RECORD_COLUMNS
        );
        let mut values = Vec::new();
        filters.push_clauses(&mut sql, &mut values);

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            let score = record
                .embedding
                .as_deref()
                .map(|e| cosine_similarity(query, e))
                .unwrap_or(0.0);
            results.push(ScoredMemory { record, score });
        }
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    pub fn list_by_owner(
        &self,
        owner: NodeId,
        collection: Option<ChartId>,
        kind: Option<MemoryKind>,
    ) -> anyhow::Result<Vec<MemoryRecord>> {
        let filters = SearchFilters {
            owner_node_ids: vec![owner],
            collection_id: collection,
            kinds: kind.into_iter().collect(),
        };
        self.list(&filters)
    }

    pub fn list(&self, filters: &SearchFilters) -> anyhow::Result<Vec<MemoryRecord>> {
        let conn = self.get_conn()?;
        let mut sql = format!("SELECT {} FROM memory_records WHERE 1 = 1", RECORD_COLUMNS);
        let mut values = Vec::new();
        filters.push_clauses(&mut sql, &mut values);
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    pub fn delete_by_owner(&self, owner: NodeId) -> anyhow::Result<usize> {
        let lock = self.owner_lock(owner);
        let _guard = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Owner write lock poisoned for node {}", owner))?;
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM memory_records WHERE owner_node_id = ?1", [owner])?;
        info!("Deleted {} memory records for node {}", deleted, owner);
        Ok(deleted)
    }

    /// Delete one owner's records of the given kinds within a collection.
    pub fn delete_by_owner_kinds(
        &self,
        owner: NodeId,
        collection: ChartId,
        kinds: &[MemoryKind],
    ) -> anyhow::Result<usize> {
        let lock = self.owner_lock(owner);
        let _guard = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Owner write lock poisoned for node {}", owner))?;
        let conn = self.get_conn()?;
        let mut sql = "DELETE FROM memory_records WHERE 1 = 1".to_string();
        let mut values = Vec::new();
        SearchFilters {
            owner_node_ids: vec![owner],
            collection_id: Some(collection),
            kinds: kinds.to_vec(),
        }
        .push_clauses(&mut sql, &mut values);
        let deleted = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        debug!("Superseded {} records for node {} in chart {}", deleted, owner, collection);
        Ok(deleted)
    }

    pub fn get_stats(&self) -> anyhow::Result<MemoryStats> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*), SUM(CASE WHEN embedding IS NULL THEN 0 ELSE 1 END)
             FROM memory_records GROUP BY kind",
        )?;
        let mut stats = MemoryStats {
            total_records: 0,
            embedded_records: 0,
            triples: 0,
            facts: 0,
            chunks: 0,
            summaries: 0,
            similarity_mode: self.mode,
        };
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let embedded: i64 = row.get(2)?;
            let count = count as usize;
            stats.total_records += count;
            stats.embedded_records += embedded as usize;
            match kind.parse::<MemoryKind>()? {
                MemoryKind::Triple => stats.triples = count,
                MemoryKind::Fact => stats.facts = count,
                MemoryKind::Chunk => stats.chunks = count,
                MemoryKind::Summary => stats.summaries = count,
            }
        }
        Ok(stats)
    }
}

fn row_to_record(row: &Row) -> anyhow::Result<MemoryRecord> {
    let kind: String = row.get(3)?;
    let embedding: Option<Vec<u8>> = row.get(5)?;
    let metadata: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        owner_node_id: row.get(1)?,
        owner_collection_id: row.get(2)?,
        kind: kind.parse()?,
        content: row.get(4)?,
        embedding: embedding.as_deref().map(decode_embedding).transpose()?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| anyhow::anyhow!("Failed to parse record metadata: {}", e))?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
            .with_timezone(&chrono::Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    fn db(mode: SimilarityMode) -> MemoryDatabase {
        MemoryDatabase::new_in_memory(mode).unwrap()
    }

    fn fact(owner: NodeId, text: &str, embedding: Vec<f32>) -> MemoryRecord {
        MemoryRecord::new(owner, 1, MemoryKind::Fact, text).with_embedding(embedding)
    }

    #[test]
    fn test_store_is_idempotent() {
        let db = db(SimilarityMode::Native);
        let record = MemoryRecord::new(7, 1, MemoryKind::Fact, "The gate is locked");
        assert!(db.memories.store(&record).unwrap());
        assert!(!db.memories.store(&record).unwrap());
        assert_eq!(db.memories.list_by_owner(7, None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_fills_missing_embedding() {
        let db = db(SimilarityMode::Native);
        let bare = MemoryRecord::new(7, 1, MemoryKind::Fact, "The gate is locked");
        db.memories.store(&bare).unwrap();
        db.memories.store(&bare.clone().with_embedding(vec![1.0, 0.0])).unwrap();
        let stored = db.memories.list_by_owner(7, Some(1), Some(MemoryKind::Fact)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].embedding.as_deref(), Some(&[1.0, 0.0][..]));
    }

    #[test]
    fn test_search_on_empty_store_is_empty() {
        for mode in [SimilarityMode::Native, SimilarityMode::Exact, SimilarityMode::Disabled] {
            let db = db(mode);
            assert!(db.memories.search_similar(&[1.0, 0.0], 5, &SearchFilters::default()).is_empty());
        }
    }

    #[test]
    fn test_native_and_exact_rank_identically() {
        for mode in [SimilarityMode::Native, SimilarityMode::Exact] {
            let db = db(mode);
            db.memories
                .store_many(&[
                    fact(1, "north", vec![1.0, 0.0]),
                    fact(1, "north-east", vec![0.7, 0.7]),
                    fact(2, "east", vec![0.0, 1.0]),
                ])
                .unwrap();
            let hits = db.memories.search_similar(&[1.0, 0.1], 2, &SearchFilters::default());
            let texts: Vec<&str> = hits.iter().map(|h| h.record.content.as_str()).collect();
            assert_eq!(texts, vec!["north", "north-east"], "mode {}", mode);
            assert!(hits[0].score >= hits[1].score);
        }
    }

    #[test]
    fn test_filters_are_applied_in_query() {
        let db = db(SimilarityMode::Native);
        db.memories
            .store_many(&[
                fact(1, "owned by one", vec![1.0, 0.0]),
                fact(2, "owned by two", vec![1.0, 0.0]),
                MemoryRecord::new(2, 1, MemoryKind::Summary, "summary of two").with_embedding(vec![1.0, 0.0]),
                MemoryRecord::new(2, 9, MemoryKind::Fact, "other chart").with_embedding(vec![1.0, 0.0]),
            ])
            .unwrap();

        let filters = SearchFilters::for_collection(1).owners([2]).kinds([MemoryKind::Fact]);
        let hits = db.memories.search_similar(&[1.0, 0.0], 10, &filters);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.content, "owned by two");
    }

    #[test]
    fn test_disabled_mode_returns_nothing() {
        let db = db(SimilarityMode::Disabled);
        db.memories.store(&fact(1, "north", vec![1.0, 0.0])).unwrap();
        assert!(db.memories.search_similar(&[1.0, 0.0], 5, &SearchFilters::default()).is_empty());
    }

    #[test]
    fn test_delete_by_owner_and_kinds() {
        let db = db(SimilarityMode::Exact);
        db.memories
            .store_many(&[
                MemoryRecord::new(1, 1, MemoryKind::Fact, "a"),
                MemoryRecord::new(1, 1, MemoryKind::Triple, "b"),
                MemoryRecord::new(1, 1, MemoryKind::Summary, "c"),
                MemoryRecord::new(2, 1, MemoryKind::Fact, "d"),
            ])
            .unwrap();
        let superseded = db
            .memories
            .delete_by_owner_kinds(1, 1, &[MemoryKind::Fact, MemoryKind::Triple])
            .unwrap();
        assert_eq!(superseded, 2);
        assert_eq!(db.memories.delete_by_owner(1).unwrap(), 1);
        assert_eq!(db.memories.list_by_owner(2, None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_stats_by_kind() {
        let db = db(SimilarityMode::Native);
        db.memories
            .store_many(&[
                fact(1, "a", vec![1.0]),
                MemoryRecord::new(1, 1, MemoryKind::Triple, "b"),
            ])
            .unwrap();
        let stats = db.memories.get_stats().unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.embedded_records, 1);
        assert_eq!(stats.facts, 1);
        assert_eq!(stats.triples, 1);
        assert_eq!(stats.similarity_mode, SimilarityMode::Native);
    }
}
