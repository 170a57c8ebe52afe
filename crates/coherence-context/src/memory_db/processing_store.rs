//! Per-node processing state used for change detection
use crate::graph::{ChartId, NodeId};
use crate::memory_db::schema::ProcessingState;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ProcessingStateStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ProcessingStateStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn get(&self, node_id: NodeId, chart_id: ChartId) -> anyhow::Result<Option<ProcessingState>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, chart_id, content_hash, triple_count, fact_count, embedding_count, processed_at
             FROM processing_state WHERE node_id = ?1 AND chart_id = ?2",
        )?;
        let state = stmt
            .query_row(params![node_id, chart_id], |row| Ok(row_to_state(row)))
            .optional()?;
        state.transpose()
    }

    /// All known states for a chart keyed by node id
    pub fn states_for_chart(&self, chart_id: ChartId) -> anyhow::Result<HashMap<NodeId, ProcessingState>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, chart_id, content_hash, triple_count, fact_count, embedding_count, processed_at
             FROM processing_state WHERE chart_id = ?1",
        )?;
        let mut rows = stmt.query([chart_id])?;
        let mut states = HashMap::new();
        while let Some(row) = rows.next()? {
            let state = row_to_state(row)?;
            states.insert(state.node_id, state);
        }
        Ok(states)
    }

    pub fn upsert(&self, state: &ProcessingState) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO processing_state
             (node_id, chart_id, content_hash, triple_count, fact_count, embedding_count, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(node_id, chart_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                triple_count = excluded.triple_count,
                fact_count = excluded.fact_count,
                embedding_count = excluded.embedding_count,
                processed_at = excluded.processed_at",
            params![
                state.node_id,
                state.chart_id,
                &state.content_hash,
                state.triple_count as i64,
                state.fact_count as i64,
                state.embedding_count as i64,
                state.processed_at.to_rfc3339(),
            ],
        )?;
        debug!("Recorded processing state for node {} in chart {}", state.node_id, state.chart_id);
        Ok(())
    }

    pub fn delete(&self, node_id: NodeId, chart_id: ChartId) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM processing_state WHERE node_id = ?1 AND chart_id = ?2",
            params![node_id, chart_id],
        )?;
        Ok(deleted > 0)
    }

    /// Forget every node of a chart so the next run reprocesses all of them.
    pub fn clear_chart(&self, chart_id: ChartId) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM processing_state WHERE chart_id = ?1", [chart_id])?;
        info!("Cleared {} processing states for chart {}", deleted, chart_id);
        Ok(deleted)
    }
}

fn row_to_state(row: &Row) -> anyhow::Result<ProcessingState> {
    let triple_count: i64 = row.get(3)?;
    let fact_count: i64 = row.get(4)?;
    let embedding_count: i64 = row.get(5)?;
    let processed_at: String = row.get(6)?;
    Ok(ProcessingState {
        node_id: row.get(0)?,
        chart_id: row.get(1)?,
        content_hash: row.get(2)?,
        triple_count: triple_count as usize,
        fact_count: fact_count as usize,
        embedding_count: embedding_count as usize,
        processed_at: chrono::DateTime::parse_from_rfc3339(&processed_at)
            .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
            .with_timezone(&chrono::Utc),
    })
}
