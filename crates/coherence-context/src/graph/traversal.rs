//! BFS over chart-container edges: neighbourhood slices and path reconstruction.
//!
//! Every entry point takes an explicit depth. Depths above [`HARD_DEPTH_CAP`]
//! are clamped and the number of visited nodes is capped by
//! [`TraversalLimits::max_visited`], so cyclic charts always terminate.

use super::{Chart, ChartId, Container, ContainerId, GraphAccessor, Node, NodeId};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// Absolute ceiling applied to every requested depth.
pub const HARD_DEPTH_CAP: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct TraversalLimits {
    pub max_depth: usize,
    pub max_visited: usize,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_depth: 25,
            max_visited: 2_000,
        }
    }
}

impl TraversalLimits {
    fn effective_depth(&self, requested: usize) -> usize {
        let depth = requested.min(self.max_depth);
        if depth > HARD_DEPTH_CAP {
            warn!("Traversal depth {} exceeds hard cap, clamping to {}", depth, HARD_DEPTH_CAP);
            HARD_DEPTH_CAP
        } else {
            depth
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

/// Target node plus its graph neighbourhood in one chart
#[derive(Debug, Clone, Serialize)]
pub struct GraphSlice {
    pub target: Node,
    pub chart: Chart,
    pub previous: Vec<Node>,
    pub next: Vec<Node>,
}

impl GraphSlice {
    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        self.previous.iter().chain(self.next.iter()).map(|n| n.id).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PathStep {
    pub node: Node,
    pub depth: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TracePath {
    /// Reached nodes in BFS order (nearest first), excluding the start node
    pub steps: Vec<PathStep>,
    /// Set when a depth or visit cap cut the walk short
    pub truncated: bool,
}

impl TracePath {
    /// Farthest-first ordering, i.e. reading order towards the start node.
    pub fn chronological(&self) -> Vec<&Node> {
        let mut steps: Vec<&PathStep> = self.steps.iter().collect();
        steps.sort_by(|a, b| b.depth.cmp(&a.depth));
        steps.into_iter().map(|s| &s.node).collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.steps.iter().map(|s| s.node.id).collect()
    }
}

fn neighbor_containers(
    graph: &dyn GraphAccessor,
    chart: ChartId,
    container: ContainerId,
    direction: Direction,
) -> Vec<Container> {
    let edges = match direction {
        Direction::Backward => graph.incoming_edges(chart, container),
        Direction::Forward => graph.outgoing_edges(chart, container),
    };
    edges
        .into_iter()
        .filter_map(|edge| {
            let other = match direction {
                Direction::Backward => edge.source,
                Direction::Forward => edge.target,
            };
            let found = graph.get_container(chart, other);
            if found.is_none() {
                debug!("Dangling edge {} in chart {} ignored", edge.id, chart);
            }
            found
        })
        .collect()
}

/// Walk `depth` hops in one direction from every container holding `start`.
///
/// Returns reached nodes with the hop at which they were first seen. Empty
/// container slots are passed through but contribute no node.
fn walk(
    graph: &dyn GraphAccessor,
    start: NodeId,
    chart: ChartId,
    direction: Direction,
    depth: usize,
    limits: &TraversalLimits,
    stop: Option<&dyn Fn(&Node) -> bool>,
) -> TracePath {
    let mut path = TracePath::default();
    let mut visited_nodes: HashSet<NodeId> = HashSet::from([start]);
    let mut visited_containers: HashSet<ContainerId> = HashSet::new();
    let mut queue: VecDeque<(Container, usize)> = VecDeque::new();

    for container in graph.containers_for(chart, start) {
        visited_containers.insert(container.id);
        queue.push_back((container, 0));
    }

    while let Some((container, hop)) = queue.pop_front() {
        if hop >= depth {
            if !neighbor_containers(graph, chart, container.id, direction).is_empty() {
                path.truncated = true;
            }
            continue;
        }
        for neighbor in neighbor_containers(graph, chart, container.id, direction) {
            if !visited_containers.insert(neighbor.id) {
                continue;
            }
            let mut expand = true;
            if let Some(node_id) = neighbor.node_id {
                if visited_nodes.insert(node_id) {
                    if let Some(node) = graph.get_node(node_id) {
                        if stop.map(|f| f(&node)).unwrap_or(false) {
                            expand = false;
                        }
                        path.steps.push(PathStep { node, depth: hop + 1 });
                    }
                }
                if path.steps.len() >= limits.max_visited {
                    warn!("Traversal from node {} hit visit cap of {}", start, limits.max_visited);
                    path.truncated = true;
                    return path;
                }
            }
            if expand {
                queue.push_back((neighbor, hop + 1));
            }
        }
    }

    path
}

/// Neighbourhood slice of `node` in `chart`.
///
/// Returns `None` when the node or chart does not exist. A node with no
/// container in the chart yields an empty slice.
pub fn slice(
    graph: &dyn GraphAccessor,
    node: NodeId,
    chart: ChartId,
    depth: usize,
    limits: &TraversalLimits,
) -> Option<GraphSlice> {
    let target = graph.get_node(node)?;
    let chart_data = graph.get_chart(chart)?;
    let depth = limits.effective_depth(depth.max(1));

    let previous = walk(graph, node, chart, Direction::Backward, depth, limits, None);
    let next = walk(graph, node, chart, Direction::Forward, depth, limits, None);

    Some(GraphSlice {
        target,
        chart: chart_data,
        previous: previous.steps.into_iter().map(|s| s.node).collect(),
        next: next.steps.into_iter().map(|s| s.node).collect(),
    })
}

/// Full backward or forward path reconstruction with an optional stop
/// condition. Nodes matching `stop` are included but not expanded.
pub fn reconstruct_path(
    graph: &dyn GraphAccessor,
    node: NodeId,
    chart: ChartId,
    direction: Direction,
    max_depth: usize,
    limits: &TraversalLimits,
    stop: Option<&dyn Fn(&Node) -> bool>,
) -> TracePath {
    let depth = limits.effective_depth(max_depth);
    walk(graph, node, chart, direction, depth, limits, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttributeValue, Chart, Edge, InMemoryGraph, Node};

    const CHART: ChartId = 1;

    /// Chain of nodes 1..=n, node i in container 100+i, edges i -> i+1.
    fn chain(n: i64) -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        graph.insert_chart(Chart {
            id: CHART,
            project_id: 1,
            name: "Main".to_string(),
            description: String::new(),
        });
        for i in 1..=n {
            graph.insert_node(Node::new(i, 1, format!("N{}", i)));
            graph.place(CHART, 100 + i, Some(i));
        }
        for i in 1..n {
            graph.link(CHART, Edge { id: i, source: 100 + i, target: 101 + i, label: None });
        }
        graph
    }

    fn ids(nodes: &[Node]) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_immediate_slice_excludes_target() {
        let graph = chain(5);
        let s = slice(&graph, 3, CHART, 1, &TraversalLimits::default()).unwrap();
        assert_eq!(ids(&s.previous), vec![2]);
        assert_eq!(ids(&s.next), vec![4]);
        assert!(!s.neighbor_ids().contains(&3));
    }

    #[test]
    fn test_deeper_slice_merges_hops() {
        let graph = chain(6);
        let s = slice(&graph, 4, CHART, 2, &TraversalLimits::default()).unwrap();
        assert_eq!(ids(&s.previous), vec![2, 3]);
        assert_eq!(ids(&s.next), vec![5, 6]);
    }

    #[test]
    fn test_slice_symmetry() {
        let mut graph = chain(4);
        graph.link(CHART, Edge { id: 50, source: 101, target: 104, label: None });
        let limits = TraversalLimits::default();
        for n in 1..=4 {
            let s = slice(&graph, n, CHART, 1, &limits).unwrap();
            for prev in &s.previous {
                let back = slice(&graph, prev.id, CHART, 1, &limits).unwrap();
                assert!(back.next.iter().any(|m| m.id == n), "{} -> {}", prev.id, n);
            }
        }
    }

    #[test]
    fn test_node_without_container_has_empty_slice() {
        let mut graph = chain(2);
        graph.insert_node(Node::new(99, 1, "Orphan"));
        let s = slice(&graph, 99, CHART, 1, &TraversalLimits::default()).unwrap();
        assert!(s.previous.is_empty());
        assert!(s.next.is_empty());
    }

    #[test]
    fn test_missing_node_or_chart_is_none() {
        let graph = chain(2);
        assert!(slice(&graph, 42, CHART, 1, &TraversalLimits::default()).is_none());
        assert!(slice(&graph, 1, 77, 1, &TraversalLimits::default()).is_none());
    }

    #[test]
    fn test_cycle_terminates_and_never_revisits_target() {
        let mut graph = chain(3);
        graph.link(CHART, Edge { id: 9, source: 103, target: 101, label: None });
        graph.link(CHART, Edge { id: 10, source: 102, target: 102, label: None });
        let path = reconstruct_path(
            &graph,
            1,
            CHART,
            Direction::Backward,
            1_000,
            &TraversalLimits::default(),
            None,
        );
        let mut reached = path.node_ids();
        reached.sort();
        assert_eq!(reached, vec![2, 3]);
    }

    #[test]
    fn test_node_in_multiple_containers_unions_neighbours() {
        let mut graph = chain(3);
        graph.insert_node(Node::new(7, 1, "Elsewhere"));
        graph.place(CHART, 200, Some(7));
        graph.place(CHART, 201, Some(2));
        graph.link(CHART, Edge { id: 20, source: 200, target: 201, label: None });
        let s = slice(&graph, 2, CHART, 1, &TraversalLimits::default()).unwrap();
        assert_eq!(ids(&s.previous), vec![1, 7]);
    }

    #[test]
    fn test_stop_condition_halts_expansion() {
        let mut graph = chain(5);
        graph.insert_node(
            Node::new(2, 1, "N2").with_attribute("checkpoint", AttributeValue::Bool(true)),
        );
        let stop = |n: &Node| n.is_checkpoint();
        let path = reconstruct_path(
            &graph,
            4,
            CHART,
            Direction::Backward,
            10,
            &TraversalLimits::default(),
            Some(&stop),
        );
        let mut reached = path.node_ids();
        reached.sort();
        assert_eq!(reached, vec![2, 3]);
        let order: Vec<NodeId> = path.chronological().iter().map(|n| n.id).collect();
        assert_eq!(order, vec![2, 3]);
    }

    #[test]
    fn test_depth_cap_marks_truncation() {
        let graph = chain(10);
        let limits = TraversalLimits { max_depth: 3, max_visited: 100 };
        let path = reconstruct_path(&graph, 10, CHART, Direction::Backward, 50, &limits, None);
        assert_eq!(path.steps.len(), 3);
        assert!(path.truncated);
    }

    #[test]
    fn test_empty_slot_is_passed_through() {
        let mut graph = chain(1);
        graph.insert_node(Node::new(2, 1, "N2"));
        graph.place(CHART, 150, None);
        graph.place(CHART, 102, Some(2));
        graph.link(CHART, Edge { id: 1, source: 101, target: 150, label: None });
        graph.link(CHART, Edge { id: 2, source: 150, target: 102, label: None });
        let one = slice(&graph, 1, CHART, 1, &TraversalLimits::default()).unwrap();
        assert!(one.next.is_empty());
        let two = slice(&graph, 1, CHART, 2, &TraversalLimits::default()).unwrap();
        assert_eq!(ids(&two.next), vec![2]);
    }
}
