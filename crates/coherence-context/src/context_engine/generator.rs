//! Incremental structural memory generation for a chart
//!
//! Changed nodes are processed in batches: facts are extracted concurrently,
//! one embedding call covers the whole batch, then records and processing
//! state are written per node. A node's failure lands in the report and
//! never aborts its batch.
use crate::change_detector::ChangeDetector;
use crate::context_engine::strategy::EngineDeps;
use crate::error::EngineError;
use crate::graph::{slice, ChartId, Node, NodeId};
use crate::knowledge::{compute_derived_triples, extract_triples};
use crate::memory_db::{MemoryKind, MemoryRecord, ProcessingState};
use crate::worker_threads::{BatchPool, Cancellation, MAX_BATCH_SIZE};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kinds rebuilt or invalidated when a node's content hash changes
const SUPERSEDED_KINDS: [MemoryKind; 3] = [MemoryKind::Triple, MemoryKind::Fact, MemoryKind::Summary];

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Nodes per batch, clamped to 1..=10
    pub batch_size: usize,
    /// Regenerate every node regardless of its content hash
    pub force: bool,
    pub skip_facts: bool,
    pub cancel: Cancellation,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            force: false,
            skip_facts: false,
            cancel: Cancellation::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Graph,
    Facts,
    Embedding,
    Storage,
    State,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeError {
    pub node_id: NodeId,
    pub stage: GenerationStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationReport {
    pub chart_id: ChartId,
    /// Nodes whose records were written, including degraded ones
    pub processed: usize,
    /// Unchanged nodes
    pub skipped: usize,
    pub total_triples: usize,
    pub total_facts: usize,
    pub total_embeddings: usize,
    pub errors: Vec<NodeError>,
    pub cancelled: bool,
}

impl GenerationReport {
    fn record_error(&mut self, node_id: NodeId, stage: GenerationStage, message: impl Into<String>) {
        let message = message.into();
        warn!("Node {} failed at {:?}: {}", node_id, stage, message);
        self.errors.push(NodeError { node_id, stage, message });
    }

    fn has_error(&self, node_id: NodeId) -> bool {
        self.errors.iter().any(|e| e.node_id == node_id)
    }
}

/// Texts produced for one node before embedding
struct NodeWork<'a> {
    node: &'a Node,
    hash: &'a str,
    triples: Vec<String>,
    facts: Vec<String>,
}

pub struct StructuralMemoryGenerator {
    deps: Arc<EngineDeps>,
    detector: ChangeDetector,
}

impl StructuralMemoryGenerator {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        let detector = ChangeDetector::new(Arc::clone(&deps.database));
        Self { deps, detector }
    }

    pub async fn generate(
        &self,
        chart: ChartId,
        options: &GeneratorOptions,
    ) -> anyhow::Result<GenerationReport> {
        let mut report = GenerationReport { chart_id: chart, ..Default::default() };
        if self.deps.graph.get_chart(chart).is_none() {
            warn!("Chart {} not found, nothing to generate", chart);
            return Ok(report);
        }

        let partition = self.detector.partition(self.deps.graph.as_ref(), chart, options.force)?;
        report.skipped = partition.unchanged.len();
        let batch_size = options.batch_size.clamp(1, MAX_BATCH_SIZE);
        info!(
            "Generating structural memory for chart {}: {} changed, {} unchanged, batch size {}",
            chart,
            partition.changed.len(),
            report.skipped,
            batch_size
        );

        for (index, batch) in partition.changed.chunks(batch_size).enumerate() {
            if options.cancel.is_cancelled() {
                info!("Generation for chart {} cancelled before batch {}", chart, index + 1);
                report.cancelled = true;
                break;
            }
            self.process_batch(chart, batch, options, &mut report).await;
            debug!(
                "Batch {} done: {} processed so far, {} errors",
                index + 1,
                report.processed,
                report.errors.len()
            );
        }

        let changed = partition.changed.len();
        if changed > 0 && report.processed == 0 && !report.cancelled {
            let all_failed = partition.changed.iter().all(|(node, _)| report.has_error(node.id));
            if all_failed {
                let first_error = report.errors.first().map(|e| e.message.clone()).unwrap_or_default();
                return Err(EngineError::AllTasksFailed { total: changed, first_error }.into());
            }
        }

        info!(
            "Chart {} done: {} processed, {} skipped, {} triples, {} facts, {} embeddings, {} errors",
            chart,
            report.processed,
            report.skipped,
            report.total_triples,
            report.total_facts,
            report.total_embeddings,
            report.errors.len()
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        chart: ChartId,
        batch: &[(Node, String)],
        options: &GeneratorOptions,
        report: &mut GenerationReport,
    ) {
        let deps = &self.deps;
        let cancel = &options.cancel;

        let mut work: Vec<NodeWork<'_>> = Vec::with_capacity(batch.len());
        for (node, hash) in batch {
            let Some(s) = slice(deps.graph.as_ref(), node.id, chart, 1, &deps.config.traversal) else {
                report.record_error(node.id, GenerationStage::Graph, "node disappeared from chart");
                continue;
            };
            let mut triples: Vec<String> = extract_triples(&s.target, &s.previous, &s.next)
                .iter()
                .map(|t| t.to_text())
                .collect();
            triples.extend(
                compute_derived_triples(&s.target, &s.previous, &s.next)
                    .iter()
                    .map(|t| t.to_text()),
            );
            work.push(NodeWork { node, hash, triples, facts: Vec::new() });
        }

        if !options.skip_facts && deps.facts.has_generator() {
            let nodes: Vec<&Node> = work.iter().map(|w| w.node).collect();
            let results = BatchPool::new(nodes.len())
                .run(nodes, |node| async move {
                    match cancel.guard(deps.facts.try_extract_facts(node)).await {
                        Some(result) => result,
                        None => Err(anyhow::anyhow!("cancelled")),
                    }
                })
                .await;
            for (item, result) in work.iter_mut().zip(results) {
                match result {
                    Ok(facts) => item.facts = facts,
                    Err(e) => report.record_error(item.node.id, GenerationStage::Facts, e.to_string()),
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
            }
        }

        let texts: Vec<String> = work
            .iter()
            .flat_map(|w| w.triples.iter().chain(&w.facts).cloned())
            .collect();
        let embeddings = match &deps.embedder {
            Some(embedder) if !texts.is_empty() => {
                match cancel.guard(embedder.embed_batch(&texts)).await {
                    Some(Ok(vectors)) if vectors.len() == texts.len() => Some(vectors),
                    Some(Ok(vectors)) => {
                        let message = format!("expected {} embeddings, got {}", texts.len(), vectors.len());
                        for w in &work {
                            report.record_error(w.node.id, GenerationStage::Embedding, message.clone());
                        }
                        None
                    }
                    Some(Err(e)) => {
                        for w in &work {
                            report.record_error(w.node.id, GenerationStage::Embedding, e.to_string());
                        }
                        None
                    }
                    None => {
                        report.cancelled = true;
                        for w in &work {
                            report.record_error(w.node.id, GenerationStage::Embedding, "cancelled");
                        }
                        None
                    }
                }
            }
            _ => None,
        };

        let mut vectors = embeddings.map(|v| v.into_iter());
        for item in work {
            let mut next_embedding = || vectors.as_mut().and_then(|it| it.next());
            let mut records = Vec::with_capacity(item.triples.len() + item.facts.len());
            let mut embedded = 0;
            for (kind, texts) in [(MemoryKind::Triple, &item.triples), (MemoryKind::Fact, &item.facts)] {
                for text in texts {
                    let mut record = MemoryRecord::new(item.node.id, chart, kind, text.as_str())
                        .with_metadata(serde_json::json!({ "source": "generator" }));
                    if let Some(vector) = next_embedding() {
                        record = record.with_embedding(vector);
                        embedded += 1;
                    }
                    records.push(record);
                }
            }

            let stored = deps
                .database
                .memories
                .delete_by_owner_kinds(item.node.id, chart, &SUPERSEDED_KINDS)
                .and_then(|_| deps.database.memories.store_many(&records));
            deps.cache.invalidate_node(item.node.id, chart);
            if let Err(e) = stored {
                report.record_error(item.node.id, GenerationStage::Storage, e.to_string());
                continue;
            }

            report.processed += 1;
            report.total_triples += item.triples.len();
            report.total_facts += item.facts.len();
            report.total_embeddings += embedded;

            if report.has_error(item.node.id) {
                continue;
            }
            let state = ProcessingState {
                node_id: item.node.id,
                chart_id: chart,
                content_hash: item.hash.to_string(),
                triple_count: item.triples.len(),
                fact_count: item.facts.len(),
                embedding_count: embedded,
                processed_at: Utc::now(),
            };
            if let Err(e) = deps.database.processing.upsert(&state) {
                report.record_error(item.node.id, GenerationStage::State, e.to_string());
            }
        }
    }
}
