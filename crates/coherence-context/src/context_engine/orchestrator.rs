use crate::capabilities::{Embedder, TextGenerator};
use crate::config::Config;
use crate::context_engine::generator::{GenerationReport, GeneratorOptions, StructuralMemoryGenerator};
use crate::context_engine::strategy::{
    ContextResult, ContextScope, ContextStrategy, EngineDeps, PrecomputeReport, StrategyId,
    StrategyRegistry,
};
use crate::graph::{ChartId, GraphAccessor};
use crate::memory_db::MemoryDatabase;
use crate::worker_threads::{Cancellation, FanOutReport, LlamaServerClient, TaskGroup};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Entry point: strategy dispatch, structural memory generation and
/// precomputation over one graph and one memory database
pub struct ContextEngine {
    deps: Arc<EngineDeps>,
    registry: StrategyRegistry,
    generator: StructuralMemoryGenerator,
    tasks: TaskGroup,
}

impl ContextEngine {
    pub fn new(deps: Arc<EngineDeps>, max_concurrent_tasks: usize) -> Self {
        let mut registry = StrategyRegistry::new();
        registry.register_defaults(Arc::clone(&deps));
        let generator = StructuralMemoryGenerator::new(Arc::clone(&deps));
        info!(
            "Context engine initialized ({} strategies, {} concurrent tasks, generation: {}, embeddings: {})",
            registry.ids().len(),
            max_concurrent_tasks,
            deps.generator.is_some(),
            deps.embedder.is_some()
        );
        Self {
            deps,
            registry,
            generator,
            tasks: TaskGroup::new(max_concurrent_tasks),
        }
    }

    /// Opens the configured database and talks to the configured LLM server
    /// for both generation and embeddings.
    pub fn from_config(config: &Config, graph: Arc<dyn GraphAccessor>) -> anyhow::Result<Self> {
        let database = Arc::new(MemoryDatabase::new(
            Path::new(&config.database_path),
            config.similarity_mode,
        )?);
        let client = Arc::new(LlamaServerClient::from_config(config)?);
        let generator: Arc<dyn TextGenerator> = client.clone();
        let embedder: Arc<dyn Embedder> = client;
        let deps = EngineDeps::new(
            graph,
            database,
            Some(generator),
            Some(embedder),
            config.strategy_config(),
        );
        Ok(Self::new(Arc::new(deps), config.max_concurrent_tasks))
    }

    pub fn deps(&self) -> &Arc<EngineDeps> {
        &self.deps
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.deps.database
    }

    /// Add or replace a strategy.
    pub fn register(&mut self, strategy: Arc<dyn ContextStrategy>) {
        self.registry.register(strategy);
    }

    pub fn strategies(&self) -> Vec<StrategyId> {
        self.registry.ids()
    }

    pub async fn build_context(
        &self,
        strategy_id: &str,
        scope: &ContextScope,
        query: Option<&str>,
    ) -> anyhow::Result<ContextResult> {
        self.build_context_with_cancel(strategy_id, scope, query, &Cancellation::new())
            .await
    }

    pub async fn build_context_with_cancel(
        &self,
        strategy_id: &str,
        scope: &ContextScope,
        query: Option<&str>,
        cancel: &Cancellation,
    ) -> anyhow::Result<ContextResult> {
        let strategy = self.registry.resolve(strategy_id)?;
        if strategy.requires_embeddings() && self.deps.embedder.is_none() {
            warn!("Strategy '{}' runs without an embedding capability", strategy.id());
        }
        if strategy.requires_generation() && self.deps.generator.is_none() {
            warn!("Strategy '{}' runs without a text generation capability", strategy.id());
        }

        let started = Instant::now();
        let mut result = strategy.build_context(scope, query, cancel).await?;
        let elapsed = started.elapsed();
        debug!(
            "Built '{}' context for node {} in chart {} ({} chars, {:?})",
            strategy.id(),
            scope.node_id,
            scope.chart_id,
            result.text.len(),
            elapsed
        );
        result.meta("elapsed_ms", elapsed.as_millis() as u64);
        Ok(result)
    }

    /// Build one context per scope, at most `max_concurrent_tasks` at a time.
    /// Strategies that write to the memory store run one scope at a time.
    pub async fn build_contexts(
        &self,
        strategy_id: &str,
        scopes: &[ContextScope],
        query: Option<&str>,
        cancel: &Cancellation,
    ) -> anyhow::Result<FanOutReport<ContextResult>> {
        let strategy = self.registry.resolve(strategy_id)?;
        let group = if strategy.writes_memory() {
            TaskGroup::new(1)
        } else {
            self.tasks.clone()
        };
        let query = query.map(str::to_string);
        let tasks: Vec<_> = scopes
            .iter()
            .map(|scope| {
                let strategy = Arc::clone(&strategy);
                let scope = *scope;
                let query = query.clone();
                let cancel = cancel.clone();
                let label = format!("{}:{}@{}", strategy.id(), scope.node_id, scope.chart_id);
                let task = async move { strategy.build_context(&scope, query.as_deref(), &cancel).await };
                (label, task)
            })
            .collect();
        info!(
            "Building {} '{}' contexts with parallelism {}",
            scopes.len(),
            strategy_id,
            group.limit()
        );
        Ok(group.run(tasks).await?)
    }

    pub async fn generate_structural_memory(
        &self,
        chart: ChartId,
        options: &GeneratorOptions,
    ) -> anyhow::Result<GenerationReport> {
        self.generator.generate(chart, options).await
    }

    /// Whole chart when `scope` is `None`, otherwise the scope's node only.
    pub async fn precompute(
        &self,
        chart: ChartId,
        strategy_id: &str,
        scope: Option<&ContextScope>,
    ) -> anyhow::Result<PrecomputeReport> {
        self.precompute_with_cancel(chart, strategy_id, scope, &Cancellation::new())
            .await
    }

    pub async fn precompute_with_cancel(
        &self,
        chart: ChartId,
        strategy_id: &str,
        scope: Option<&ContextScope>,
        cancel: &Cancellation,
    ) -> anyhow::Result<PrecomputeReport> {
        let strategy = self.registry.resolve(strategy_id)?;
        let report = strategy.precompute(chart, scope, cancel).await?;
        info!(
            "Precompute '{}' for chart {}: {} entries written{}",
            strategy.id(),
            chart,
            report.entries_written,
            if report.skipped { " (skipped)" } else { "" }
        );
        Ok(report)
    }
}
