//! Cache-aside helper shared by every extractor
//!
//! Lookups go hot cache -> memory store -> compute. Computed values are
//! written to the store as records of the requested kind.
use crate::graph::{ChartId, NodeId};
use crate::memory_db::{MemoryDatabase, MemoryKind, MemoryRecord};
use moka::sync::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node_id: NodeId,
    pub collection_id: ChartId,
    pub kind: MemoryKind,
}

impl CacheKey {
    pub fn new(node_id: NodeId, collection_id: ChartId, kind: MemoryKind) -> Self {
        Self { node_id, collection_id, kind }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub texts: Vec<String>,
    /// True when no computation was needed
    pub from_cache: bool,
}

pub struct KnowledgeCache {
    database: Arc<MemoryDatabase>,
    hot: Cache<CacheKey, Arc<Vec<String>>>,
}

impl KnowledgeCache {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self::with_capacity(database, 10_000)
    }

    pub fn with_capacity(database: Arc<MemoryDatabase>, capacity: u64) -> Self {
        Self {
            database,
            hot: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(Duration::from_secs(3600))
                .build(),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    /// Return cached texts for `key`, or run `compute` and persist its output.
    ///
    /// Empty outputs are not persisted, so the next lookup computes again.
    /// Errors from `compute` are returned untouched.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> anyhow::Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<String>>>,
    {
        if let Some(texts) = self.hot.get(&key) {
            return Ok(CacheLookup { texts: texts.as_ref().clone(), from_cache: true });
        }

        let stored = self
            .database
            .memories
            .list_by_owner(key.node_id, Some(key.collection_id), Some(key.kind))?;
        if !stored.is_empty() {
            let texts: Vec<String> = stored.into_iter().map(|r| r.content).collect();
            self.hot.insert(key, Arc::new(texts.clone()));
            debug!("Cache hit in store for node {} ({})", key.node_id, key.kind);
            return Ok(CacheLookup { texts, from_cache: true });
        }

        let texts = compute().await?;
        if !texts.is_empty() {
            let records: Vec<MemoryRecord> = texts
                .iter()
                .map(|t| {
                    MemoryRecord::new(key.node_id, key.collection_id, key.kind, t.as_str())
                        .with_metadata(serde_json::json!({ "source": "generated" }))
                })
                .collect();
            self.database.memories.store_many(&records)?;
            self.hot.insert(key, Arc::new(texts.clone()));
        }
        Ok(CacheLookup { texts, from_cache: false })
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.hot.invalidate(key);
    }

    /// Drop every hot entry for a node within a collection.
    pub fn invalidate_node(&self, node_id: NodeId, collection_id: ChartId) {
        for kind in MemoryKind::ALL {
            self.hot.invalidate(&CacheKey::new(node_id, collection_id, kind));
        }
    }
}
