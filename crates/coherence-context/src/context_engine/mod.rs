//! Context engine module - strategies, retrieval and structural memory generation

pub mod combined;
pub mod context_builder;
pub mod full_context;
pub mod generator;
pub mod hierarchical;
pub mod hmem;
pub mod orchestrator;
pub mod positional;
pub mod retriever;
pub mod strategy;
pub mod structural;

pub use combined::CombinedStrategy;
pub use context_builder::{BuiltContext, ContextBuilder, ContextBuilderConfig, Section};
pub use full_context::FullContextStrategy;
pub use generator::{
    GenerationReport, GenerationStage, GeneratorOptions, NodeError, StructuralMemoryGenerator,
};
pub use hierarchical::{compose_layers, HierarchicalGraphStrategy, PlayerState};
pub use hmem::HmemStrategy;
pub use orchestrator::ContextEngine;
pub use positional::PositionalIndex;
pub use retriever::{IterativeRetriever, RetrievalOutcome, RetrieverConfig, StopReason};
pub use strategy::{
    ContextLayer, ContextResult, ContextScope, ContextStrategy, EngineDeps, PrecomputeReport,
    StrategyConfig, StrategyId, StrategyRegistry,
};
pub use structural::{gather_evidence, Evidence, StructuralMemoryStrategy};

/// Engine over `graph` wired from configuration
pub fn create_default_engine(
    config: &crate::config::Config,
    graph: std::sync::Arc<dyn crate::graph::GraphAccessor>,
) -> anyhow::Result<ContextEngine> {
    ContextEngine::from_config(config, graph)
}
