//! Content hashing of nodes and comparison against last processed state
use crate::graph::{ChartId, GraphAccessor, Node, NodeId};
use crate::memory_db::MemoryDatabase;
use rayon::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// BLAKE3 hex digest of a canonical rendering of the node and its incident
/// edges in `chart`. Insertion order of attributes and edges does not matter.
pub fn content_hash(graph: &dyn GraphAccessor, node: &Node, chart: ChartId) -> String {
    let mut attributes: Vec<(String, &'static str, String)> = node
        .attributes
        .iter()
        .map(|a| (a.name.clone(), a.value.type_tag(), a.value.to_string()))
        .collect();
    attributes.sort();

    let mut edges: Vec<(&'static str, Option<NodeId>, i64, String)> = Vec::new();
    for container in graph.containers_for(chart, node.id) {
        for edge in graph.incoming_edges(chart, container.id) {
            let other = graph.get_container(chart, edge.source).and_then(|c| c.node_id);
            edges.push(("in", other, edge.source, edge.label.unwrap_or_default()));
        }
        for edge in graph.outgoing_edges(chart, container.id) {
            let other = graph.get_container(chart, edge.target).and_then(|c| c.node_id);
            edges.push(("out", other, edge.target, edge.label.unwrap_or_default()));
        }
    }
    edges.sort();

    // serde_json maps are key-sorted
    let canonical = json!({
        "id": node.id,
        "name": node.name,
        "description": node.description,
        "attributes": attributes,
        "edges": edges,
    });
    blake3::hash(canonical.to_string().as_bytes()).to_hex().to_string()
}

/// Nodes of a chart split by whether they need regeneration
#[derive(Debug, Default)]
pub struct ChangePartition {
    /// Changed nodes with their current hash
    pub changed: Vec<(Node, String)>,
    pub unchanged: Vec<NodeId>,
}

pub struct ChangeDetector {
    database: Arc<MemoryDatabase>,
}

impl ChangeDetector {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }

    /// No prior state counts as changed.
    pub fn has_changed(
        &self,
        graph: &dyn GraphAccessor,
        node: &Node,
        chart: ChartId,
    ) -> anyhow::Result<bool> {
        let current = content_hash(graph, node, chart);
        Ok(match self.database.processing.get(node.id, chart)? {
            Some(state) => state.content_hash != current,
            None => true,
        })
    }

    pub fn partition(
        &self,
        graph: &dyn GraphAccessor,
        chart: ChartId,
        force: bool,
    ) -> anyhow::Result<ChangePartition> {
        let nodes = graph.chart_nodes(chart);
        let known = self.database.processing.states_for_chart(chart)?;

        let hashed: Vec<(Node, String)> = nodes
            .into_par_iter()
            .map(|node| {
                let hash = content_hash(graph, &node, chart);
                (node, hash)
            })
            .collect();

        let mut partition = ChangePartition::default();
        for (node, hash) in hashed {
            let unchanged = !force
                && known
                    .get(&node.id)
                    .map(|state| state.content_hash == hash)
                    .unwrap_or(false);
            if unchanged {
                partition.unchanged.push(node.id);
            } else {
                partition.changed.push((node, hash));
            }
        }
        debug!(
            "Chart {}: {} changed, {} unchanged",
            chart,
            partition.changed.len(),
            partition.unchanged.len()
        );
        Ok(partition)
    }
}
