//! Structural memory: triples, LLM facts, summaries and iterative retrieval
use crate::context_engine::context_builder::ContextBuilder;
use crate::context_engine::generator::{GeneratorOptions, StructuralMemoryGenerator};
use crate::context_engine::retriever::{IterativeRetriever, RetrievalOutcome};
use crate::context_engine::strategy::{
    ContextResult, ContextScope, ContextStrategy, EngineDeps, PrecomputeReport, StrategyId,
};
use crate::graph::{ChartId, GraphSlice, Node, NodeId};
use crate::knowledge::{compute_derived_triples, extract_triples, AtomicFact, KnowledgeTriple, Summary};
use crate::memory_db::SearchFilters;
use crate::utils::TextUtils;
use crate::worker_threads::{BatchPool, Cancellation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the structural strategies know about one slice
#[derive(Debug, Default)]
pub struct Evidence {
    pub triples: Vec<KnowledgeTriple>,
    pub facts: Vec<AtomicFact>,
    pub summaries: Vec<Summary>,
    pub retrieval: Option<RetrievalOutcome>,
    pub cancelled: bool,
}

impl Evidence {
    pub fn triples_text(&self) -> String {
        self.triples.iter().map(|t| t.to_text()).collect::<Vec<_>>().join("\n")
    }

    pub fn facts_text(&self, names: &HashMap<NodeId, String>) -> String {
        self.facts
            .iter()
            .map(|f| format!("- [{}] {}", names.get(&f.node_id).map(String::as_str).unwrap_or("?"), f.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn node_names(slice: &GraphSlice) -> HashMap<NodeId, String> {
    std::iter::once(&slice.target)
        .chain(&slice.previous)
        .chain(&slice.next)
        .map(|n| (n.id, n.name.clone()))
        .collect()
}

/// Collect triples for the target and, unless fact extraction is skipped,
/// facts for the target and its neighbours, neighbour summaries and
/// iteratively retrieved memories.
pub async fn gather_evidence(
    deps: &EngineDeps,
    slice: &GraphSlice,
    query: Option<&str>,
    retrieve: bool,
    cancel: &Cancellation,
) -> Evidence {
    let chart = slice.chart.id;
    let mut evidence = Evidence::default();
    evidence.triples = extract_triples(&slice.target, &slice.previous, &slice.next);
    evidence
        .triples
        .extend(compute_derived_triples(&slice.target, &slice.previous, &slice.next));

    if deps.config.skip_fact_extraction {
        return evidence;
    }

    let nodes: Vec<&Node> = std::iter::once(&slice.target)
        .chain(&slice.previous)
        .chain(&slice.next)
        .collect();
    let pool = BatchPool::new(nodes.len());
    let fact_results = pool
        .run(nodes, |node| async move {
            Ok::<_, anyhow::Error>(cancel.guard(deps.facts.facts_for(node, chart)).await)
        })
        .await;
    for result in fact_results.into_iter().flatten() {
        match result {
            Some(facts) => evidence.facts.extend(facts),
            None => evidence.cancelled = true,
        }
    }

    let neighbours: Vec<&Node> = slice.previous.iter().chain(&slice.next).collect();
    let summary_results = pool
        .run(neighbours, |node| async move {
            Ok::<_, anyhow::Error>(cancel.guard(deps.facts.summary_for(node, chart)).await)
        })
        .await;
    for result in summary_results.into_iter().flatten() {
        match result {
            Some(summary) => evidence.summaries.extend(summary),
            None => evidence.cancelled = true,
        }
    }

    if retrieve && !evidence.cancelled {
        if let Some(embedder) = &deps.embedder {
            let retriever = IterativeRetriever::new(
                Arc::clone(&deps.database),
                Arc::clone(embedder),
                deps.generator.clone(),
                deps.config.retriever.clone(),
            );
            let query_text = match query.filter(|q| !q.trim().is_empty()) {
                Some(q) => q.to_string(),
                None => TextUtils::first_words(&slice.target.describe(), 64).into_owned(),
            };
            let mut owners = vec![slice.target.id];
            owners.extend(slice.neighbor_ids());
            let filters = SearchFilters::for_collection(chart).owners(owners);
            let outcome = retriever.retrieve(&query_text, &filters, cancel).await;
            evidence.cancelled |= outcome.cancelled();
            evidence.retrieval = Some(outcome);
        }
    }

    debug!(
        "Evidence for node {}: {} triples, {} facts, {} summaries",
        slice.target.id,
        evidence.triples.len(),
        evidence.facts.len(),
        evidence.summaries.len()
    );
    evidence
}

pub struct StructuralMemoryStrategy {
    deps: Arc<EngineDeps>,
}

impl StructuralMemoryStrategy {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl ContextStrategy for StructuralMemoryStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::StructuralMemory
    }

    fn requires_embeddings(&self) -> bool {
        !self.deps.config.skip_fact_extraction
    }

    fn requires_generation(&self) -> bool {
        !self.deps.config.skip_fact_extraction
    }

    fn writes_memory(&self) -> bool {
        true
    }

    async fn build_context(
        &self,
        scope: &ContextScope,
        query: Option<&str>,
        cancel: &Cancellation,
    ) -> anyhow::Result<ContextResult> {
        let Some(slice) = self.deps.slice(scope) else {
            return Ok(ContextResult::empty(self.id(), "node or chart not found"));
        };
        let evidence = gather_evidence(&self.deps, &slice, query, true, cancel).await;
        let names = node_names(&slice);

        let mut builder = ContextBuilder::with_budget(self.deps.config.max_context_chars);
        if let Some(query) = query {
            builder.section("Question", query.trim(), 100);
        }
        builder.section("Target", slice.target.describe(), 95);
        builder.section("Atomic facts", evidence.facts_text(&names), 85);
        builder.section("Knowledge triples", evidence.triples_text(), 80);
        builder.section(
            "Neighbour summaries",
            evidence
                .summaries
                .iter()
                .map(|s| format!("- [{}] {}", names.get(&s.node_id).map(String::as_str).unwrap_or("?"), s.text))
                .collect::<Vec<_>>()
                .join("\n"),
            60,
        );
        if let Some(retrieval) = &evidence.retrieval {
            builder.section(
                "Related memories",
                retrieval
                    .records
                    .iter()
                    .map(|r| format!("- ({:.2}) {}", r.score, r.record.content))
                    .collect::<Vec<_>>()
                    .join("\n"),
                50,
            );
        }
        let built = builder.build();

        let mut result = ContextResult::new(self.id());
        result.text = built.text;
        result
            .meta("fact_count", evidence.facts.len())
            .meta("triple_count", evidence.triples.len())
            .meta("summary_count", evidence.summaries.len())
            .meta("dropped_sections", built.dropped)
            .meta("cancelled", evidence.cancelled);
        if let Some(retrieval) = &evidence.retrieval {
            result.meta("retrieval", serde_json::json!({
                "queries": retrieval.queries,
                "iterations": retrieval.iterations,
                "stop_reason": retrieval.stop_reason,
                "records": retrieval.records.len(),
            }));
        }
        result.triples = evidence.triples;
        result.facts = evidence.facts;
        result.summaries = evidence.summaries;
        Ok(result)
    }

    /// Whole chart: run the generator. Single scope: warm its fact cache.
    async fn precompute(
        &self,
        chart: ChartId,
        scope: Option<&ContextScope>,
        cancel: &Cancellation,
    ) -> anyhow::Result<PrecomputeReport> {
        if let Some(scope) = scope {
            let Some(slice) = self.deps.slice(scope) else {
                return Ok(PrecomputeReport::skipped(self.id(), chart, "node or chart not found"));
            };
            let evidence = gather_evidence(&self.deps, &slice, None, false, cancel).await;
            return Ok(PrecomputeReport {
                strategy: self.id(),
                chart_id: chart,
                entries_written: evidence.facts.len() + evidence.summaries.len(),
                skipped: false,
                note: evidence.cancelled.then(|| "cancelled".to_string()),
            });
        }

        let generator = StructuralMemoryGenerator::new(Arc::clone(&self.deps));
        let options = GeneratorOptions {
            skip_facts: self.deps.config.skip_fact_extraction,
            cancel: cancel.clone(),
            ..GeneratorOptions::default()
        };
        let report = generator.generate(chart, &options).await?;
        info!(
            "Structural precompute for chart {}: {} processed, {} skipped",
            chart, report.processed, report.skipped
        );
        Ok(PrecomputeReport {
            strategy: self.id(),
            chart_id: chart,
            entries_written: report.total_triples + report.total_facts,
            skipped: false,
            note: (!report.errors.is_empty()).then(|| format!("{} node errors", report.errors.len())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Embedder, TextGenerator};
    use crate::context_engine::strategy::StrategyConfig;
    use crate::graph::{AttributeValue, Chart, Edge, InMemoryGraph};
    use crate::memory_db::{MemoryDatabase, MemoryKind, SimilarityMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.starts_with("Summarize") {
                Ok("A short summary of the element.".to_string())
            } else {
                Ok("1. The room is flooded with water\n2. ok".to_string())
            }
        }
    }

    struct FlatEmbedder;

    #[async_trait]
    impl Embedder for FlatEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn graph() -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        graph.insert_chart(Chart {
            id: 1,
            project_id: 1,
            name: "Sewers".to_string(),
            description: String::new(),
        });
        graph.insert_node(Node::new(1, 1, "A").with_attribute("intensity", AttributeValue::Number(20.0)));
        graph.insert_node(Node::new(2, 1, "B").with_attribute("intensity", AttributeValue::Number(85.0)));
        graph.place(1, 10, Some(1));
        graph.place(1, 20, Some(2));
        graph.link(1, Edge { id: 1, source: 10, target: 20, label: None });
        graph
    }

    fn deps(
        generator: Option<Arc<dyn TextGenerator>>,
        embedder: Option<Arc<dyn Embedder>>,
        skip: bool,
    ) -> Arc<EngineDeps> {
        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Exact).unwrap());
        let config = StrategyConfig { skip_fact_extraction: skip, ..StrategyConfig::default() };
        Arc::new(EngineDeps::new(Arc::new(graph()), db, generator, embedder, config))
    }

    #[tokio::test]
    async fn test_skip_mode_uses_triples_only() {
        let strategy = StructuralMemoryStrategy::new(deps(None, None, true));
        assert!(!strategy.requires_generation());
        assert!(!strategy.requires_embeddings());
        let result = strategy
            .build_context(&ContextScope::new(2, 1), None, &Cancellation::new())
            .await
            .unwrap();
        assert!(result.facts.is_empty());
        assert!(result
            .triples
            .iter()
            .any(|t| t.head == "A -> B" && t.tail.to_string() == "spike (+65)"));
        assert!(result.text.contains("## Knowledge triples"));
    }

    #[tokio::test]
    async fn test_facts_and_summaries_are_cached_between_builds() {
        let generator = Arc::new(FixedGenerator { calls: AtomicUsize::new(0) });
        let deps = deps(Some(generator.clone()), Some(Arc::new(FlatEmbedder)), false);
        let strategy = StructuralMemoryStrategy::new(Arc::clone(&deps));
        assert!(strategy.requires_generation());

        let scope = ContextScope::new(2, 1);
        let first = strategy.build_context(&scope, Some("flooding"), &Cancellation::new()).await.unwrap();
        assert_eq!(first.facts.len(), 2);
        assert!(first.facts.iter().all(|f| f.text == "The room is flooded with water"));
        assert_eq!(first.summaries.len(), 1);
        assert_eq!(first.summaries[0].node_id, 1);

        let calls = generator.calls.load(Ordering::SeqCst);
        let second = strategy.build_context(&scope, Some("flooding"), &Cancellation::new()).await.unwrap();
        assert_eq!(second.facts.len(), 2);
        let stored = deps.database.memories.list_by_owner(1, Some(1), Some(MemoryKind::Summary)).unwrap();
        assert_eq!(stored.len(), 1);
        // only the retriever's refinement calls run again
        assert!(generator.calls.load(Ordering::SeqCst) - calls <= deps.config.retriever.max_iterations);
    }

    #[tokio::test]
    async fn test_scope_precompute_warms_cache() {
        let generator = Arc::new(FixedGenerator { calls: AtomicUsize::new(0) });
        let strategy = StructuralMemoryStrategy::new(deps(Some(generator), None, false));
        let report = strategy
            .precompute(1, Some(&ContextScope::new(1, 1)), &Cancellation::new())
            .await
            .unwrap();
        assert!(!report.skipped);
        assert_eq!(report.entries_written, 3);
    }
}
