//! Strategy identifiers, the uniform result type, and the registry
use crate::capabilities::{Embedder, TextGenerator};
use crate::context_engine::retriever::RetrieverConfig;
use crate::error::EngineError;
use crate::graph::{slice, ChartId, GraphAccessor, GraphSlice, NodeId, TraversalLimits};
use crate::knowledge::{AtomicFact, FactExtractor, KnowledgeCache, KnowledgeTriple, Summary};
use crate::memory_db::MemoryDatabase;
use crate::worker_threads::Cancellation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    FullContext,
    StructuralMemory,
    HierarchicalGraph,
    Hmem,
    Combined,
}

impl StrategyId {
    pub const ALL: [StrategyId; 5] = [
        StrategyId::FullContext,
        StrategyId::StructuralMemory,
        StrategyId::HierarchicalGraph,
        StrategyId::Hmem,
        StrategyId::Combined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::FullContext => "full_context",
            StrategyId::StructuralMemory => "structural_memory",
            StrategyId::HierarchicalGraph => "hierarchical_graph",
            StrategyId::Hmem => "hmem",
            StrategyId::Combined => "combined",
        }
    }

    pub fn valid_ids() -> Vec<String> {
        Self::ALL.iter().map(|id| id.as_str().to_string()).collect()
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s.trim())
            .ok_or_else(|| EngineError::UnknownStrategy {
                id: s.to_string(),
                valid: Self::valid_ids(),
            })
    }
}

/// What to build context for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextScope {
    pub node_id: NodeId,
    pub chart_id: ChartId,
    /// Neighbourhood depth for slices
    #[serde(default = "default_depth")]
    pub depth: usize,
}

fn default_depth() -> usize {
    1
}

impl ContextScope {
    pub fn new(node_id: NodeId, chart_id: ChartId) -> Self {
        Self { node_id, chart_id, depth: 1 }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextLayer {
    pub layer: u8,
    pub name: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positional_index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl ContextLayer {
    pub fn new(layer: u8, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            layer,
            name: name.into(),
            content: content.into(),
            positional_index: None,
            score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    pub strategy: StrategyId,
    pub text: String,
    pub triples: Vec<KnowledgeTriple>,
    pub facts: Vec<AtomicFact>,
    pub summaries: Vec<Summary>,
    pub layers: Vec<ContextLayer>,
    pub metadata: Map<String, Value>,
}

impl ContextResult {
    pub fn new(strategy: StrategyId) -> Self {
        Self {
            strategy,
            text: String::new(),
            triples: Vec::new(),
            facts: Vec::new(),
            summaries: Vec::new(),
            layers: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Result for a scope that resolves to nothing (missing node or chart).
    pub fn empty(strategy: StrategyId, reason: &str) -> Self {
        let mut result = Self::new(strategy);
        result.meta("status", "empty");
        result.meta("reason", reason);
        result
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn meta(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecomputeReport {
    pub strategy: StrategyId,
    pub chart_id: ChartId,
    pub entries_written: usize,
    /// Nothing to precompute for this strategy, or a capability was missing
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PrecomputeReport {
    pub fn skipped(strategy: StrategyId, chart_id: ChartId, note: impl Into<String>) -> Self {
        Self {
            strategy,
            chart_id,
            entries_written: 0,
            skipped: true,
            note: Some(note.into()),
        }
    }
}

/// Tunables shared by every strategy
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub traversal: TraversalLimits,
    pub retriever: RetrieverConfig,
    pub skip_fact_extraction: bool,
    pub fact_min_length: usize,
    pub max_context_chars: usize,
    /// Candidates kept per layer during top-down routing
    pub hmem_top_k: usize,
    /// Build missing layer entries on first use
    pub auto_precompute: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            traversal: TraversalLimits::default(),
            retriever: RetrieverConfig::default(),
            skip_fact_extraction: false,
            fact_min_length: crate::knowledge::facts::DEFAULT_MIN_FACT_LENGTH,
            max_context_chars: 16_000,
            hmem_top_k: 3,
            auto_precompute: true,
        }
    }
}

/// Collaborators handed to every strategy
pub struct EngineDeps {
    pub graph: Arc<dyn GraphAccessor>,
    pub database: Arc<MemoryDatabase>,
    pub generator: Option<Arc<dyn TextGenerator>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub cache: Arc<KnowledgeCache>,
    pub facts: Arc<FactExtractor>,
    pub config: StrategyConfig,
}

impl EngineDeps {
    pub fn new(
        graph: Arc<dyn GraphAccessor>,
        database: Arc<MemoryDatabase>,
        generator: Option<Arc<dyn TextGenerator>>,
        embedder: Option<Arc<dyn Embedder>>,
        config: StrategyConfig,
    ) -> Self {
        let cache = Arc::new(KnowledgeCache::new(Arc::clone(&database)));
        let facts = Arc::new(FactExtractor::new(
            generator.clone(),
            Arc::clone(&cache),
            config.fact_min_length,
        ));
        Self { graph, database, generator, embedder, cache, facts, config }
    }

    pub fn slice(&self, scope: &ContextScope) -> Option<GraphSlice> {
        slice(
            self.graph.as_ref(),
            scope.node_id,
            scope.chart_id,
            scope.depth,
            &self.config.traversal,
        )
    }
}

#[async_trait]
pub trait ContextStrategy: Send + Sync {
    fn id(&self) -> StrategyId;

    fn requires_embeddings(&self) -> bool;

    fn requires_generation(&self) -> bool;

    /// Strategies that write to the memory store run one scope at a time.
    fn writes_memory(&self) -> bool {
        false
    }

    async fn build_context(
        &self,
        scope: &ContextScope,
        query: Option<&str>,
        cancel: &Cancellation,
    ) -> anyhow::Result<ContextResult>;

    async fn precompute(
        &self,
        chart: ChartId,
        _scope: Option<&ContextScope>,
        _cancel: &Cancellation,
    ) -> anyhow::Result<PrecomputeReport> {
        Ok(PrecomputeReport::skipped(self.id(), chart, "nothing to precompute"))
    }
}

/// Strategy lookup by identifier. Populated explicitly via [`register_defaults`](Self::register_defaults).
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyId, Arc<dyn ContextStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any strategy already registered under the same id.
    pub fn register(&mut self, strategy: Arc<dyn ContextStrategy>) {
        info!("Registered context strategy '{}'", strategy.id());
        self.strategies.insert(strategy.id(), strategy);
    }

    pub fn register_defaults(&mut self, deps: Arc<EngineDeps>) {
        use crate::context_engine::{
            CombinedStrategy, FullContextStrategy, HierarchicalGraphStrategy, HmemStrategy,
            StructuralMemoryStrategy,
        };
        self.register(Arc::new(FullContextStrategy::new(Arc::clone(&deps))));
        self.register(Arc::new(StructuralMemoryStrategy::new(Arc::clone(&deps))));
        self.register(Arc::new(HierarchicalGraphStrategy::new(Arc::clone(&deps))));
        self.register(Arc::new(HmemStrategy::new(Arc::clone(&deps))));
        self.register(Arc::new(CombinedStrategy::new(deps)));
    }

    pub fn get(&self, id: StrategyId) -> Result<Arc<dyn ContextStrategy>, EngineError> {
        self.strategies
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::StrategyNotRegistered(id.to_string()))
    }

    /// Parse and look up; unknown ids fail with the list of valid ids.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ContextStrategy>, EngineError> {
        self.get(id.parse::<StrategyId>()?)
    }

    pub fn ids(&self) -> Vec<StrategyId> {
        let mut ids: Vec<StrategyId> = self.strategies.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_ids_roundtrip() {
        for id in StrategyId::ALL {
            assert_eq!(id.as_str().parse::<StrategyId>().unwrap(), id);
        }
    }

    #[test]
    fn test_unknown_strategy_lists_valid_ids() {
        let err = "nonexistent".parse::<StrategyId>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nonexistent"));
        for id in StrategyId::ALL {
            assert!(msg.contains(id.as_str()));
        }
    }

    #[test]
    fn test_empty_registry_reports_unregistered() {
        let registry = StrategyRegistry::new();
        assert!(matches!(
            registry.resolve("hmem"),
            Err(EngineError::StrategyNotRegistered(_))
        ));
        assert!(matches!(
            registry.resolve("nonexistent"),
            Err(EngineError::UnknownStrategy { .. })
        ));
    }

    #[test]
    fn test_empty_result_metadata() {
        let result = ContextResult::empty(StrategyId::FullContext, "node not found");
        assert!(result.is_empty());
        assert_eq!(result.metadata["status"], "empty");
    }
}
