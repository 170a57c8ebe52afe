//! Raw text of the target and its neighbours, no capability calls
use crate::context_engine::context_builder::ContextBuilder;
use crate::context_engine::hierarchical::domain_text;
use crate::context_engine::strategy::{
    ContextResult, ContextScope, ContextStrategy, EngineDeps, StrategyId,
};
use crate::graph::Node;
use crate::worker_threads::Cancellation;
use async_trait::async_trait;
use std::sync::Arc;

pub struct FullContextStrategy {
    deps: Arc<EngineDeps>,
}

impl FullContextStrategy {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }
}

fn describe_all(nodes: &[Node]) -> String {
    nodes.iter().map(Node::describe).collect::<Vec<_>>().join("\n\n")
}

#[async_trait]
impl ContextStrategy for FullContextStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::FullContext
    }

    fn requires_embeddings(&self) -> bool {
        false
    }

    fn requires_generation(&self) -> bool {
        false
    }

    async fn build_context(
        &self,
        scope: &ContextScope,
        query: Option<&str>,
        _cancel: &Cancellation,
    ) -> anyhow::Result<ContextResult> {
        let Some(slice) = self.deps.slice(scope) else {
            return Ok(ContextResult::empty(self.id(), "node or chart not found"));
        };

        let mut builder = ContextBuilder::with_budget(self.deps.config.max_context_chars);
        if let Some(query) = query {
            builder.section("Question", query.trim(), 100);
        }
        builder.section("Target", slice.target.describe(), 95);
        let mut chart = slice.chart.name.clone();
        if !slice.chart.description.trim().is_empty() {
            chart.push('\n');
            chart.push_str(slice.chart.description.trim());
        }
        builder.section("Chart", chart, 40);
        builder.section("Previous", describe_all(&slice.previous), 70);
        builder.section("Next", describe_all(&slice.next), 70);
        if let Some(project) = self.deps.graph.project_context(slice.chart.project_id) {
            builder.section("Project", domain_text(Some(&project)), 30);
        }
        let built = builder.build();

        let mut result = ContextResult::new(self.id());
        result.text = built.text;
        result
            .meta("previous_count", slice.previous.len())
            .meta("next_count", slice.next.len())
            .meta("dropped_sections", built.dropped)
            .meta("truncated", built.truncated);
        Ok(result)
    }
}
