//! Hierarchical layers 1-3 with structural evidence as the episode layer
use crate::context_engine::hierarchical::{compose_layers, render_layers};
use crate::context_engine::strategy::{
    ContextLayer, ContextResult, ContextScope, ContextStrategy, EngineDeps, StrategyId,
};
use crate::context_engine::structural::{gather_evidence, node_names};
use crate::worker_threads::Cancellation;
use async_trait::async_trait;
use std::sync::Arc;

pub struct CombinedStrategy {
    deps: Arc<EngineDeps>,
}

impl CombinedStrategy {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl ContextStrategy for CombinedStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::Combined
    }

    fn requires_embeddings(&self) -> bool {
        false
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
        let Some(composed) = compose_layers(&self.deps, scope) else {
            return Ok(ContextResult::empty(self.id(), "node or chart not found"));
        };
        let evidence = gather_evidence(&self.deps, &composed.slice, query, false, cancel).await;

        let mut content = composed.slice.target.describe();
        let triples = evidence.triples_text();
        if !triples.is_empty() {
            content.push_str("\n\nTriples:\n");
            content.push_str(&triples);
        }
        let facts = evidence.facts_text(&node_names(&composed.slice));
        if !facts.is_empty() {
            content.push_str("\n\nFacts:\n");
            content.push_str(&facts);
        }
        let mut episode = ContextLayer::new(4, "Structural evidence", content);
        episode.positional_index = composed
            .layers
            .get(3)
            .and_then(|l| l.positional_index.clone());

        let mut layers: Vec<ContextLayer> = composed.layers.into_iter().take(3).collect();
        layers.push(episode);
        let built = render_layers(&layers, query, self.deps.config.max_context_chars);

        let mut result = ContextResult::new(self.id());
        result.text = built.text;
        result.layers = layers;
        result
            .meta("trace_length", composed.trace.path.steps.len())
            .meta("fact_count", evidence.facts.len())
            .meta("dropped_sections", built.dropped)
            .meta("cancelled", evidence.cancelled);
        result.triples = evidence.triples;
        result.facts = evidence.facts;
        result.summaries = evidence.summaries;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::strategy::StrategyConfig;
    use crate::graph::{AttributeValue, Chart, Edge, InMemoryGraph, Node};
    use crate::memory_db::{MemoryDatabase, SimilarityMode};

    #[tokio::test]
    async fn test_layer_four_carries_structural_evidence() {
        let mut graph = InMemoryGraph::new();
        graph.insert_chart(Chart {
            id: 1,
            project_id: 1,
            name: "Arena".to_string(),
            description: String::new(),
        });
        graph.insert_node(Node::new(1, 1, "Warmup").with_attribute("difficulty", AttributeValue::Number(10.0)));
        graph.insert_node(Node::new(2, 1, "Boss").with_attribute("difficulty", AttributeValue::Number(90.0)));
        graph.place(1, 1, Some(1));
        graph.place(1, 2, Some(2));
        graph.link(1, Edge { id: 1, source: 1, target: 2, label: None });

        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Exact).unwrap());
        let config = StrategyConfig { skip_fact_extraction: true, ..StrategyConfig::default() };
        let strategy = CombinedStrategy::new(Arc::new(EngineDeps::new(Arc::new(graph), db, None, None, config)));
        assert!(strategy.writes_memory());

        let result = strategy
            .build_context(&ContextScope::new(2, 1), None, &Cancellation::new())
            .await
            .unwrap();
        let numbers: Vec<u8> = result.layers.iter().map(|l| l.layer).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(result.layers[3].name, "Structural evidence");
        assert!(result.layers[3].content.contains("(Warmup -> Boss, difficulty_transition, spike (+80))"));
        assert!(result.text.contains("## Layer 4: Structural evidence"));
    }
}
