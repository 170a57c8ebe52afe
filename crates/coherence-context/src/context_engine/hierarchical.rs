//! Deterministic four-layer context: domain, category, trace, episode
use crate::context_engine::context_builder::{BuiltContext, ContextBuilder, Section};
use crate::context_engine::positional::{path_hash, PositionalIndex};
use crate::context_engine::strategy::{
    ContextLayer, ContextResult, ContextScope, ContextStrategy, EngineDeps, StrategyId,
};
use crate::graph::{
    reconstruct_path, AttributeValue, Chart, ChartId, Direction, GraphAccessor, GraphSlice, Node,
    ProjectContext, TracePath,
};
use crate::utils::TextUtils;
use crate::worker_threads::Cancellation;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

const ITEM_KEYWORDS: &[&str] = &["item", "collect", "pickup", "reward"];
const MECHANIC_KEYWORDS: &[&str] = &["unlock", "mechanic", "ability", "skill"];
const NARRATIVE_KEYWORDS: &[&str] = &["narrative", "story", "beat", "lore"];

pub const LAYER_NAMES: [&str; 4] = ["Domain", "Category", "Trace", "Episode"];

/// What the player has accumulated along the path leading to a node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlayerState {
    pub items: Vec<String>,
    pub mechanics: Vec<String>,
    pub narrative_beats: Vec<String>,
    pub checkpoints: Vec<String>,
}

impl PlayerState {
    /// Aggregate over nodes in reading order.
    pub fn from_path(nodes: &[&Node]) -> Self {
        let mut state = Self::default();
        for node in nodes {
            if node.is_checkpoint() {
                push_unique(&mut state.checkpoints, node.name.clone());
            }
            for attr in &node.attributes {
                let bucket = if TextUtils::contains_any(&attr.name, ITEM_KEYWORDS) {
                    &mut state.items
                } else if TextUtils::contains_any(&attr.name, MECHANIC_KEYWORDS) {
                    &mut state.mechanics
                } else if TextUtils::contains_any(&attr.name, NARRATIVE_KEYWORDS) {
                    &mut state.narrative_beats
                } else {
                    continue;
                };
                match &attr.value {
                    AttributeValue::Text(text) => {
                        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                            push_unique(bucket, part.to_string());
                        }
                    }
                    AttributeValue::Bool(true) => push_unique(bucket, attr.name.clone()),
                    AttributeValue::Bool(false) => {}
                    AttributeValue::Number(_) => {
                        push_unique(bucket, format!("{}: {}", attr.name, attr.value))
                    }
                }
            }
        }
        state
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.mechanics.is_empty()
            && self.narrative_beats.is_empty()
            && self.checkpoints.is_empty()
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for (label, values) in [
            ("Collected items", &self.items),
            ("Unlocked mechanics", &self.mechanics),
            ("Narrative beats", &self.narrative_beats),
            ("Checkpoints passed", &self.checkpoints),
        ] {
            if !values.is_empty() {
                lines.push(format!("{}: {}", label, values.join(", ")));
            }
        }
        lines.join("\n")
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Backward path to a node, cut at the nearest checkpoint
#[derive(Debug, Clone)]
pub struct NodeTrace {
    pub path: TracePath,
    pub player_state: PlayerState,
    pub path_hash: String,
    pub content: String,
}

pub fn domain_text(project: Option<&ProjectContext>) -> String {
    let Some(project) = project else {
        return "No project context available.".to_string();
    };
    let mut out = String::new();
    if !project.concept.trim().is_empty() {
        out.push_str(&format!("Concept: {}", project.concept.trim()));
    }
    if !project.pillars.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("Pillars:");
        for (i, pillar) in project.pillars.iter().enumerate() {
            out.push_str(&format!("\n{}. {}", i + 1, pillar));
        }
    }
    if out.is_empty() {
        out.push_str("No project context available.");
    }
    out
}

pub fn category_text(graph: &dyn GraphAccessor, chart: &Chart) -> String {
    let mut out = format!("Chart: {}", chart.name);
    if !chart.description.trim().is_empty() {
        out.push('\n');
        out.push_str(chart.description.trim());
    }
    out.push_str(&format!(
        "\nContains {} nodes and {} connections.",
        graph.chart_nodes(chart.id).len(),
        graph.chart_edges(chart.id).len()
    ));
    out
}

pub fn trace_for(deps: &EngineDeps, node: &Node, chart: ChartId) -> NodeTrace {
    let limits = &deps.config.traversal;
    let stop = |n: &Node| n.is_checkpoint();
    let path = reconstruct_path(
        deps.graph.as_ref(),
        node.id,
        chart,
        Direction::Backward,
        limits.max_depth,
        limits,
        Some(&stop),
    );
    let chronological = path.chronological();
    let player_state = PlayerState::from_path(&chronological);

    let mut ids: Vec<_> = chronological.iter().map(|n| n.id).collect();
    ids.push(node.id);
    let hash = path_hash(&ids);

    let mut content = if chronological.is_empty() {
        format!("{} is a starting point.", node.name)
    } else {
        let names: Vec<&str> = chronological.iter().map(|n| n.name.as_str()).collect();
        format!("Path so far: {} -> {}", names.join(" -> "), node.name)
    };
    if path.truncated {
        content.push_str("\n(earlier history omitted)");
    }
    if !player_state.is_empty() {
        content.push('\n');
        content.push_str(&player_state.render());
    }
    NodeTrace { path, player_state, path_hash: hash, content }
}

pub fn episode_text(slice: &GraphSlice) -> String {
    let mut out = slice.target.describe();
    if !slice.previous.is_empty() {
        let names: Vec<&str> = slice.previous.iter().map(|n| n.name.as_str()).collect();
        out.push_str(&format!("\nPreceded by: {}", names.join(", ")));
    }
    if !slice.next.is_empty() {
        let names: Vec<&str> = slice.next.iter().map(|n| n.name.as_str()).collect();
        out.push_str(&format!("\nLeads to: {}", names.join(", ")));
    }
    out
}

/// Layers for one scope plus the pieces they were built from
pub struct ComposedLayers {
    pub slice: GraphSlice,
    pub trace: NodeTrace,
    pub layers: Vec<ContextLayer>,
}

pub fn compose_layers(deps: &EngineDeps, scope: &ContextScope) -> Option<ComposedLayers> {
    let slice = deps.slice(scope)?;
    let project_id = slice.chart.project_id;
    let project = deps.graph.project_context(project_id);
    let trace = trace_for(deps, &slice.target, scope.chart_id);

    let indices = [
        PositionalIndex::domain(project_id),
        PositionalIndex::category(project_id, scope.chart_id),
        PositionalIndex::trace(project_id, scope.chart_id, trace.path_hash.clone()),
        PositionalIndex::episode(project_id, scope.chart_id, trace.path_hash.clone(), scope.node_id),
    ];
    let contents = [
        domain_text(project.as_ref()),
        category_text(deps.graph.as_ref(), &slice.chart),
        trace.content.clone(),
        episode_text(&slice),
    ];
    let layers = indices
        .iter()
        .zip(contents)
        .enumerate()
        .map(|(i, (index, content))| {
            let mut layer = ContextLayer::new(i as u8 + 1, LAYER_NAMES[i], content);
            layer.positional_index = Some(index.to_string());
            layer
        })
        .collect();

    Some(ComposedLayers { slice, trace, layers })
}

fn layer_priority(layer: &ContextLayer) -> u8 {
    let base: u8 = match layer.layer {
        4 => 100,
        3 => 80,
        1 => 70,
        _ => 50,
    };
    // retrieved neighbours rank below the scope's own layers
    if layer.score.is_some() {
        base - 30
    } else {
        base
    }
}

pub fn render_layers(layers: &[ContextLayer], query: Option<&str>, budget: usize) -> BuiltContext {
    let mut builder = ContextBuilder::with_budget(budget);
    if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
        builder.section("Question", query.trim(), 100);
    }
    for layer in layers {
        builder.push(Section::new(
            format!("Layer {}: {}", layer.layer, layer.name),
            layer.content.clone(),
            layer_priority(layer),
        ));
    }
    builder.build()
}

pub struct HierarchicalGraphStrategy {
    deps: Arc<EngineDeps>,
}

impl HierarchicalGraphStrategy {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl ContextStrategy for HierarchicalGraphStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::HierarchicalGraph
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
        let Some(composed) = compose_layers(&self.deps, scope) else {
            return Ok(ContextResult::empty(self.id(), "node or chart not found"));
        };
        let built = render_layers(&composed.layers, query, self.deps.config.max_context_chars);
        debug!(
            "Hierarchical context for node {}: trace of {} nodes",
            scope.node_id,
            composed.trace.path.steps.len()
        );

        let mut result = ContextResult::new(self.id());
        result.text = built.text;
        result.layers = composed.layers;
        result
            .meta("trace_length", composed.trace.path.steps.len())
            .meta("trace_truncated", composed.trace.path.truncated)
            .meta("player_state", serde_json::to_value(&composed.trace.player_state)?)
            .meta("dropped_sections", built.dropped);
        Ok(result)
    }
}
