//! Hierarchical memory: four layers stored under positional indices and
//! routed top-down by similarity (trace candidates first, then episodes
//! beneath the best traces).
use crate::context_engine::hierarchical::{
    category_text, compose_layers, domain_text, episode_text, render_layers, trace_for,
    ComposedLayers, LAYER_NAMES,
};
use crate::context_engine::positional::PositionalIndex;
use crate::context_engine::strategy::{
    ContextLayer, ContextResult, ContextScope, ContextStrategy, EngineDeps, PrecomputeReport,
    StrategyId,
};
use crate::graph::{slice, ChartId, Node};
use crate::memory_db::{LayerEmbedding, ScoredLayer};
use crate::worker_threads::Cancellation;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct HmemStrategy {
    deps: Arc<EngineDeps>,
    /// Serializes first-use precompute so concurrent callers embed a chart once
    precompute_lock: Mutex<()>,
}

fn entry(index: &PositionalIndex, content: String, children: Vec<String>) -> LayerEmbedding {
    LayerEmbedding {
        positional_index: index.to_string(),
        layer: index.layer,
        project_id: index.project,
        chart_id: index.chart,
        node_id: index.node,
        content,
        embedding: None,
        parent_index: index.parent().map(|p| p.to_string()),
        child_indices: children,
        created_at: Utc::now(),
    }
}

fn stored_layer(entry: &LayerEmbedding, score: Option<f32>) -> ContextLayer {
    let name = LAYER_NAMES
        .get(entry.layer.saturating_sub(1) as usize)
        .copied()
        .unwrap_or("Layer");
    let mut layer = ContextLayer::new(entry.layer, name, entry.content.clone());
    layer.positional_index = Some(entry.positional_index.clone());
    layer.score = score;
    layer
}

impl HmemStrategy {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps, precompute_lock: Mutex::new(()) }
    }

    async fn ensure_precomputed(
        &self,
        category: &PositionalIndex,
        chart: ChartId,
        cancel: &Cancellation,
    ) -> anyhow::Result<()> {
        let layers = &self.deps.database.layers;
        if layers.count_prefix(&category.child_prefix())? > 0 {
            return Ok(());
        }
        let _guard = self.precompute_lock.lock().await;
        if layers.count_prefix(&category.child_prefix())? > 0 {
            return Ok(());
        }
        info!("No layer entries for chart {}, precomputing", chart);
        if let Err(e) = self.precompute(chart, None, cancel).await {
            warn!("Layer precompute for chart {} failed: {}", chart, e);
        }
        Ok(())
    }

    /// Current text for a stored trace or episode entry, or `None` when the
    /// node is gone or its path no longer hashes to the entry's index.
    fn current_content(&self, chart: ChartId, entry: &LayerEmbedding) -> Option<String> {
        let index: PositionalIndex = entry.positional_index.parse().ok()?;
        let node_id = match entry.layer {
            3 => entry
                .child_indices
                .first()
                .and_then(|c| c.parse::<PositionalIndex>().ok())
                .and_then(|c| c.node)?,
            _ => entry.node_id?,
        };
        let deps = &self.deps;
        let node = deps.graph.get_node(node_id)?;
        let trace = trace_for(deps, &node, chart);
        if index.path_hash.as_deref() != Some(trace.path_hash.as_str()) {
            return None;
        }
        if entry.layer == 3 {
            return Some(trace.content);
        }
        let node_slice = slice(deps.graph.as_ref(), node_id, chart, 1, &deps.config.traversal)?;
        Some(episode_text(&node_slice))
    }

    /// Swap stored text for current text; drops entries whose node or path is gone.
    fn refresh_routed(&self, chart: ChartId, routed: Vec<ScoredLayer>) -> (Vec<ScoredLayer>, usize) {
        let mut refreshed = 0;
        let fresh = routed
            .into_iter()
            .filter_map(|mut scored| {
                let content = self.current_content(chart, &scored.entry)?;
                if content != scored.entry.content {
                    refreshed += 1;
                    scored.entry.content = content;
                }
                Some(scored)
            })
            .collect();
        (fresh, refreshed)
    }

    /// Layer entries for `nodes` of one chart, L1 and L2 first.
    fn build_entries(&self, chart: ChartId, nodes: &[Node]) -> anyhow::Result<Vec<LayerEmbedding>> {
        let deps = &self.deps;
        let Some(chart_data) = deps.graph.get_chart(chart) else {
            return Ok(Vec::new());
        };
        let project = chart_data.project_id;
        let domain = PositionalIndex::domain(project);
        let category = PositionalIndex::category(project, chart);

        let mut lower = Vec::with_capacity(nodes.len() * 2);
        let mut trace_indices = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Some(node_slice) = slice(deps.graph.as_ref(), node.id, chart, 1, &deps.config.traversal) else {
                continue;
            };
            let trace = trace_for(deps, node, chart);
            let trace_index = PositionalIndex::trace(project, chart, trace.path_hash.clone());
            let episode_index = PositionalIndex::episode(project, chart, trace.path_hash, node.id);
            lower.push(entry(&trace_index, trace.content, vec![episode_index.to_string()]));
            lower.push(entry(&episode_index, episode_text(&node_slice), Vec::new()));
            trace_indices.push(trace_index.to_string());
        }

        // L1 and L2 keep children registered by earlier precomputes
        let mut domain_children: Vec<String> = deps
            .database
            .layers
            .get(&domain.to_string())?
            .map(|e| e.child_indices)
            .unwrap_or_default();
        if !domain_children.contains(&category.to_string()) {
            domain_children.push(category.to_string());
        }
        let mut category_children: Vec<String> = deps
            .database
            .layers
            .get(&category.to_string())?
            .map(|e| e.child_indices)
            .unwrap_or_default();
        for index in trace_indices {
            if !category_children.contains(&index) {
                category_children.push(index);
            }
        }

        let project_context = deps.graph.project_context(project);
        let mut entries = vec![
            entry(&domain, domain_text(project_context.as_ref()), domain_children),
            entry(&category, category_text(deps.graph.as_ref(), &chart_data), category_children),
        ];
        entries.extend(lower);
        Ok(entries)
    }

    /// Follow the best trace candidates down to their episodes.
    fn route(&self, category: &PositionalIndex, query: &[f32], exclude: &HashSet<String>) -> Vec<ScoredLayer> {
        let top_k = self.deps.config.hmem_top_k;
        let layers = &self.deps.database.layers;
        let traces = layers.search_prefix(&category.child_prefix(), 3, query, top_k);

        let mut episodes: Vec<ScoredLayer> = Vec::new();
        for trace in &traces {
            let prefix = match trace.entry.positional_index.parse::<PositionalIndex>() {
                Ok(index) => index.child_prefix(),
                Err(e) => {
                    warn!("Skipping malformed layer index: {}", e);
                    continue;
                }
            };
            episodes.extend(layers.search_prefix(&prefix, 4, query, top_k));
        }
        episodes.retain(|e| !exclude.contains(&e.entry.positional_index));
        episodes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        episodes.truncate(top_k);

        let mut routed: Vec<ScoredLayer> = traces
            .into_iter()
            .filter(|t| !exclude.contains(&t.entry.positional_index))
            .collect();
        routed.extend(episodes);
        routed
    }

    fn degraded(&self, composed: ComposedLayers, query: Option<&str>, reason: &str) -> ContextResult {
        warn!("HMEM context degraded to deterministic layers: {}", reason);
        let built = render_layers(&composed.layers, query, self.deps.config.max_context_chars);
        let mut result = ContextResult::new(self.id());
        result.text = built.text;
        result.layers = composed.layers;
        result.meta("degraded", reason).meta("dropped_sections", built.dropped);
        result
    }
}

#[async_trait]
impl ContextStrategy for HmemStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::Hmem
    }

    fn requires_embeddings(&self) -> bool {
        true
    }

    fn requires_generation(&self) -> bool {
        false
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
        let Some(embedder) = self.deps.embedder.clone() else {
            return Ok(self.degraded(composed, query, "no embedding capability"));
        };

        let project = composed.slice.chart.project_id;
        let category = PositionalIndex::category(project, scope.chart_id);
        let layers = &self.deps.database.layers;
        if self.deps.config.auto_precompute {
            self.ensure_precomputed(&category, scope.chart_id, cancel).await?;
        }

        let query_text = match query.filter(|q| !q.trim().is_empty()) {
            Some(q) => q.to_string(),
            None => composed.slice.target.describe(),
        };
        let embedding = match cancel.guard(embedder.embed(&query_text)).await {
            None => return Ok(self.degraded(composed, query, "cancelled")),
            Some(Err(e)) => {
                return Ok(self.degraded(composed, query, &format!("query embedding failed: {}", e)))
            }
            Some(Ok(embedding)) => embedding,
        };

        // the scope's own layers always carry freshly composed text; stored
        // entries that are missing or out of date are re-embedded
        let mut context_layers = Vec::with_capacity(8);
        let mut own: HashSet<String> = HashSet::new();
        let mut stale = 0;
        let mut missing = 0;
        for layer in &composed.layers {
            let index = layer.positional_index.clone().unwrap_or_default();
            match layers.get(&index)? {
                None => missing += 1,
                Some(stored) => {
                    let current = if stored.layer >= 3 {
                        self.current_content(scope.chart_id, &stored).as_deref() == Some(stored.content.as_str())
                    } else {
                        stored.content == layer.content
                    };
                    if !current {
                        stale += 1;
                    }
                }
            }
            context_layers.push(layer.clone());
            own.insert(index);
        }
        if stale > 0 || (missing > 0 && self.deps.config.auto_precompute) {
            debug!("Refreshing layer entries for node {} ({} stale, {} missing)", scope.node_id, stale, missing);
            if let Err(e) = self.precompute(scope.chart_id, Some(scope), cancel).await {
                warn!("Layer refresh for node {} failed: {}", scope.node_id, e);
            }
        }

        let (routed, refreshed) = self.refresh_routed(scope.chart_id, self.route(&category, &embedding, &own));
        debug!(
            "HMEM routed {} related entries for node {} ({} with updated text)",
            routed.len(),
            scope.node_id,
            refreshed
        );
        for scored in &routed {
            context_layers.push(stored_layer(&scored.entry, Some(scored.score)));
        }

        let built = render_layers(&context_layers, query, self.deps.config.max_context_chars);
        let mut result = ContextResult::new(self.id());
        result.text = built.text;
        result.layers = context_layers;
        result
            .meta("routed_entries", routed.len())
            .meta("stale_entries", stale + refreshed)
            .meta("dropped_sections", built.dropped);
        Ok(result)
    }

    async fn precompute(
        &self,
        chart: ChartId,
        scope: Option<&ContextScope>,
        cancel: &Cancellation,
    ) -> anyhow::Result<PrecomputeReport> {
        let Some(embedder) = self.deps.embedder.clone() else {
            return Ok(PrecomputeReport::skipped(self.id(), chart, "no embedding capability"));
        };
        let Some(chart_data) = self.deps.graph.get_chart(chart) else {
            return Ok(PrecomputeReport::skipped(self.id(), chart, "chart not found"));
        };

        let nodes: Vec<Node> = match scope {
            Some(scope) => self.deps.graph.get_node(scope.node_id).into_iter().collect(),
            None => self.deps.graph.chart_nodes(chart),
        };
        let mut entries = self.build_entries(chart, &nodes)?;
        let texts: Vec<String> = entries.iter().map(|e| e.content.clone()).collect();
        let vectors = match cancel.guard(embedder.embed_batch(&texts)).await {
            None => {
                return Ok(PrecomputeReport::skipped(self.id(), chart, "cancelled"));
            }
            Some(result) => result?,
        };
        if vectors.len() != entries.len() {
            return Err(anyhow::anyhow!(
                "Expected {} layer embeddings, got {}",
                entries.len(),
                vectors.len()
            ));
        }
        for (entry, vector) in entries.iter_mut().zip(vectors) {
            entry.embedding = Some(vector);
        }

        let layers = &self.deps.database.layers;
        if scope.is_none() {
            let category = PositionalIndex::category(chart_data.project_id, chart);
            let traces = category.child_prefix();
            let episodes = format!("L4.{}", traces.trim_start_matches("L3."));
            layers.delete_prefix(&traces)?;
            layers.delete_prefix(&episodes)?;
        }
        layers.upsert_many(&entries)?;
        info!("Precomputed {} layer entries for chart {}", entries.len(), chart);

        Ok(PrecomputeReport {
            strategy: self.id(),
            chart_id: chart,
            entries_written: entries.len(),
            skipped: false,
            note: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Embedder;
    use crate::context_engine::strategy::StrategyConfig;
    use crate::graph::{AttributeValue, Chart, Edge, InMemoryGraph, ProjectContext};
    use crate::memory_db::{MemoryDatabase, SimilarityMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Two axes: water and fire.
    struct ThemeEmbedder;

    #[async_trait]
    impl Embedder for ThemeEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("water") { 1.0 } else { 0.0 },
                        if t.contains("fire") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    fn graph() -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        graph.set_project(ProjectContext {
            project_id: 7,
            concept: "Elemental temples".to_string(),
            pillars: vec!["Exploration".to_string()],
        });
        graph.insert_chart(Chart {
            id: 3,
            project_id: 7,
            name: "Temples".to_string(),
            description: String::new(),
        });
        let nodes = [
            Node::new(1, 7, "Entrance"),
            Node::new(2, 7, "Water temple").with_description("Flooded corridors"),
            Node::new(3, 7, "Fire temple").with_description("Lava rivers"),
            Node::new(4, 7, "Summit").with_attribute("checkpoint", AttributeValue::Bool(true)),
        ];
        for node in nodes {
            let id = node.id;
            graph.insert_node(node);
            graph.place(3, 30 + id, Some(id));
        }
        graph.link(3, Edge { id: 1, source: 31, target: 32, label: None });
        graph.link(3, Edge { id: 2, source: 31, target: 33, label: None });
        graph.link(3, Edge { id: 3, source: 32, target: 34, label: None });
        graph.link(3, Edge { id: 4, source: 33, target: 34, label: None });
        graph
    }

    fn strategy(embedder: Option<Arc<dyn Embedder>>) -> HmemStrategy {
        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Native).unwrap());
        HmemStrategy::new(Arc::new(EngineDeps::new(
            Arc::new(graph()),
            db,
            None,
            embedder,
            StrategyConfig::default(),
        )))
    }

    #[tokio::test]
    async fn test_precompute_writes_linked_layers() {
        let hmem = strategy(Some(Arc::new(ThemeEmbedder)));
        let report = hmem.precompute(3, None, &Cancellation::new()).await.unwrap();
        // L1 + L2 + (L3 + L4) per node
        assert_eq!(report.entries_written, 2 + 4 * 2);

        let layers = &hmem.deps.database.layers;
        assert_eq!(layers.count_prefix("L3.7.3.").unwrap(), 4);
        assert_eq!(layers.count_prefix("L4.7.3.").unwrap(), 4);
        let category = layers.get("L2.7.3").unwrap().unwrap();
        assert_eq!(category.parent_index.as_deref(), Some("L1.7"));
        assert_eq!(category.child_indices.len(), 4);
        let domain = layers.get("L1.7").unwrap().unwrap();
        assert_eq!(domain.child_indices, vec!["L2.7.3".to_string()]);

        // a second full precompute replaces rather than duplicates
        hmem.precompute(3, None, &Cancellation::new()).await.unwrap();
        assert_eq!(layers.count_prefix("L4.7.3.").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_routing_prefers_matching_episode() {
        let hmem = strategy(Some(Arc::new(ThemeEmbedder)));
        let result = hmem
            .build_context(&ContextScope::new(4, 3), Some("Where does the fire burn?"), &Cancellation::new())
            .await
            .unwrap();
        let routed: Vec<&ContextLayer> = result.layers.iter().filter(|l| l.score.is_some()).collect();
        assert!(!routed.is_empty());
        let best_episode = routed.iter().find(|l| l.layer == 4).unwrap();
        assert!(best_episode.content.starts_with("Fire temple"));
        assert!(result.text.contains("## Layer 1: Domain"));
    }

    /// Counts multi-text calls, which only precompute and refresh make.
    struct CountingEmbedder {
        batches: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.len() > 1 {
                self.batches.fetch_add(1, Ordering::SeqCst);
            }
            ThemeEmbedder.embed_batch(texts).await
        }
    }

    fn strategy_over(graph: InMemoryGraph, db: Arc<MemoryDatabase>, embedder: Arc<dyn Embedder>) -> HmemStrategy {
        HmemStrategy::new(Arc::new(EngineDeps::new(
            Arc::new(graph),
            db,
            None,
            Some(embedder),
            StrategyConfig::default(),
        )))
    }

    #[tokio::test]
    async fn test_edited_node_is_served_with_current_text() {
        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Native).unwrap());
        let before = strategy_over(graph(), Arc::clone(&db), Arc::new(ThemeEmbedder));
        let result = before
            .build_context(&ContextScope::new(2, 3), None, &Cancellation::new())
            .await
            .unwrap();
        assert!(result.layers[3].content.contains("Flooded corridors"));

        let mut edited = graph();
        edited.insert_node(Node::new(2, 7, "Water temple").with_description("Drained corridors"));
        let after = strategy_over(edited, Arc::clone(&db), Arc::new(ThemeEmbedder));

        // another scope routes to the edited episode
        let result = after
            .build_context(&ContextScope::new(4, 3), Some("water"), &Cancellation::new())
            .await
            .unwrap();
        let routed: Vec<&ContextLayer> = result.layers.iter().filter(|l| l.score.is_some()).collect();
        assert!(routed.iter().all(|l| !l.content.contains("Flooded")));
        assert!(routed.iter().any(|l| l.content.contains("Drained corridors")));

        // the edited node itself refreshes its stored entries
        let result = after
            .build_context(&ContextScope::new(2, 3), None, &Cancellation::new())
            .await
            .unwrap();
        assert!(result.layers[3].content.contains("Drained corridors"));
        assert_eq!(result.metadata["stale_entries"], 1);
        let index = result.layers[3].positional_index.clone().unwrap();
        let stored = db.layers.get(&index).unwrap().unwrap();
        assert!(stored.content.contains("Drained corridors"));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_precomputes_once() {
        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Native).unwrap());
        let embedder = Arc::new(CountingEmbedder { batches: AtomicUsize::new(0) });
        let hmem = strategy_over(graph(), db, embedder.clone());
        assert!(hmem.writes_memory());

        let cancel = Cancellation::new();
        let (scope1, scope2, scope3) = (
            ContextScope::new(1, 3),
            ContextScope::new(2, 3),
            ContextScope::new(3, 3),
        );
        let (a, b, c) = tokio::join!(
            hmem.build_context(&scope1, None, &cancel),
            hmem.build_context(&scope2, None, &cancel),
            hmem.build_context(&scope3, None, &cancel),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(embedder.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_embedder_degrades_to_hierarchical() {
        let hmem = strategy(None);
        let report = hmem.precompute(3, None, &Cancellation::new()).await.unwrap();
        assert!(report.skipped);
        let result = hmem
            .build_context(&ContextScope::new(2, 3), None, &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(result.layers.len(), 4);
        assert_eq!(result.metadata["degraded"], "no embedding capability");
    }
}
