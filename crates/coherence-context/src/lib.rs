//! Evidence-bearing context construction over a design graph

pub mod capabilities;
pub mod change_detector;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod graph;
pub mod knowledge;
pub mod memory_db;
pub mod telemetry;
pub mod utils;
pub mod worker_threads;

// Public API exports
pub use capabilities::{Embedder, TextGenerator};
pub use config::Config;
pub use context_engine::{
    create_default_engine, ContextEngine, ContextResult, ContextScope, GenerationReport,
    GeneratorOptions, PrecomputeReport, StrategyId,
};
pub use error::EngineError;
pub use graph::{GraphAccessor, InMemoryGraph};
pub use memory_db::{MemoryDatabase, SimilarityMode};
