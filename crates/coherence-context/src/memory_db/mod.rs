//! Memory database module - SQLite-based storage for memory records, processing state, and layer embeddings
pub mod schema;
pub mod migration;
pub mod memory_store;
pub mod processing_store;
pub mod layer_store;
pub use schema::*;
pub use migration::MigrationManager;
pub use memory_store::{MemoryStats, MemoryStore, SearchFilters};
pub use processing_store::ProcessingStateStore;
pub use layer_store::LayerStore;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::info;

/// How `search_similar` ranks candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMode {
    /// Rank inside SQLite via the `cosine_sim` scalar function
    Native,
    /// Load the filtered candidates and rank them in process
    Exact,
    /// Similarity search unavailable; searches return nothing
    Disabled,
}

impl fmt::Display for SimilarityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SimilarityMode::Native => "native",
            SimilarityMode::Exact => "exact",
            SimilarityMode::Disabled => "disabled",
        })
    }
}

impl FromStr for SimilarityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(SimilarityMode::Native),
            "exact" => Ok(SimilarityMode::Exact),
            "disabled" | "off" | "none" => Ok(SimilarityMode::Disabled),
            other => Err(anyhow::anyhow!("Unknown similarity mode: {}", other)),
        }
    }
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(embedding)?)
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() { return 0.0; }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

/// Registers `cosine_sim(blob, blob) -> real` on a connection.
pub(crate) fn register_similarity_function(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "cosine_sim",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: Option<Vec<u8>> = ctx.get(0)?;
            let b: Option<Vec<u8>> = ctx.get(1)?;
            let (Some(a), Some(b)) = (a, b) else {
                return Ok(0.0f64);
            };
            let a: Vec<f32> = bincode::deserialize(&a)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let b: Vec<f32> = bincode::deserialize(&b)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(cosine_similarity(&a, &b) as f64)
        },
    )
}

/// Upper bound for a range scan that matches every key starting with `prefix`.
pub(crate) fn prefix_upper_bound(prefix: &str) -> String {
    format!("{}{}", prefix, char::MAX)
}

pub struct MemoryDatabase {
    pub memories: MemoryStore,
    pub processing: ProcessingStateStore,
    pub layers: LayerStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path, mode: SimilarityMode) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
                register_similarity_function(conn)
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
        }
        info!("Memory database initialized successfully (similarity: {})", mode);
        Ok(Self::from_pool(Arc::new(pool), mode))
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// so its contents live as long as the pool.
    pub fn new_in_memory(mode: SimilarityMode) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| register_similarity_function(conn));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        {
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool), mode))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>, mode: SimilarityMode) -> Self {
        Self {
            memories: MemoryStore::new(Arc::clone(&pool), mode),
            processing: ProcessingStateStore::new(Arc::clone(&pool)),
            layers: LayerStore::new(Arc::clone(&pool), mode),
            pool,
        }
    }

    pub fn similarity_mode(&self) -> SimilarityMode {
        self.memories.mode()
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
