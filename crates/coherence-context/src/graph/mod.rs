//! Graph module - read-only view of the design graph consumed by the engine

pub mod traversal;

pub use traversal::{
    reconstruct_path, slice, Direction, GraphSlice, PathStep, TracePath, TraversalLimits,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

pub type NodeId = i64;
pub type ChartId = i64;
pub type ContainerId = i64;
pub type ProjectId = i64;
pub type EdgeId = i64;

/// Typed attribute value attached to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Short type tag used in canonical serialisation.
    pub fn type_tag(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Number(_) => "number",
            AttributeValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self { name: name.into(), value }
    }
}

/// An evaluable design unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Insertion-ordered attribute values
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Node {
    pub fn new(id: NodeId, project_id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            project_id,
            name: name.into(),
            description: String::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| &a.value)
    }

    /// Checkpoint nodes bound backward walks in the trace layer.
    pub fn is_checkpoint(&self) -> bool {
        ["checkpoint", "is_checkpoint"]
            .iter()
            .any(|key| self.attribute(key).and_then(AttributeValue::as_bool) == Some(true))
    }

    /// Plain-text rendering of the node used by every context strategy.
    pub fn describe(&self) -> String {
        let mut out = self.name.clone();
        if !self.description.trim().is_empty() {
            out.push('\n');
            out.push_str(self.description.trim());
        }
        if !self.attributes.is_empty() {
            out.push_str("\nAttributes:");
            for attr in &self.attributes {
                out.push_str(&format!("\n- {}: {}", attr.name, attr.value));
            }
        }
        out
    }
}

/// A slot in a chart, optionally wrapping a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

/// Directed relation between two container slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: ContainerId,
    pub target: ContainerId,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: ChartId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Project-level intent: concept text plus ordered guiding statements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: ProjectId,
    #[serde(default)]
    pub concept: String,
    #[serde(default)]
    pub pillars: Vec<String>,
}

/// Read-only graph access. Missing entities yield `None` or empty lists.
pub trait GraphAccessor: Send + Sync {
    fn get_node(&self, id: NodeId) -> Option<Node>;
    fn get_chart(&self, id: ChartId) -> Option<Chart>;
    fn get_container(&self, chart: ChartId, container: ContainerId) -> Option<Container>;
    fn chart_containers(&self, chart: ChartId) -> Vec<Container>;
    fn chart_edges(&self, chart: ChartId) -> Vec<Edge>;
    fn incoming_edges(&self, chart: ChartId, container: ContainerId) -> Vec<Edge>;
    fn outgoing_edges(&self, chart: ChartId, container: ContainerId) -> Vec<Edge>;
    fn project_context(&self, project: ProjectId) -> Option<ProjectContext>;

    /// Every container in `chart` that wraps `node`.
    fn containers_for(&self, chart: ChartId, node: NodeId) -> Vec<Container> {
        self.chart_containers(chart)
            .into_iter()
            .filter(|c| c.node_id == Some(node))
            .collect()
    }

    /// Distinct nodes placed in `chart`, in container order.
    fn chart_nodes(&self, chart: ChartId) -> Vec<Node> {
        let mut seen = std::collections::HashSet::new();
        self.chart_containers(chart)
            .into_iter()
            .filter_map(|c| c.node_id)
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.get_node(id))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChartData {
    chart: Option<Chart>,
    containers: Vec<Container>,
    edges: Vec<Edge>,
}

/// Serialisable form of a whole graph, used by the CLI and fixtures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub projects: Vec<ProjectContext>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub charts: Vec<ChartSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSnapshot {
    #[serde(flatten)]
    pub chart: Chart,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// HashMap-backed graph accessor
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraph {
    nodes: HashMap<NodeId, Node>,
    charts: HashMap<ChartId, ChartData>,
    projects: HashMap<ProjectId, ProjectContext>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut graph = Self::new();
        for project in snapshot.projects {
            graph.set_project(project);
        }
        for node in snapshot.nodes {
            graph.insert_node(node);
        }
        for chart in snapshot.charts {
            let chart_id = chart.chart.id;
            graph.insert_chart(chart.chart);
            for container in chart.containers {
                graph.place(chart_id, container.id, container.node_id);
            }
            for edge in chart.edges {
                graph.link(chart_id, edge);
            }
        }
        graph
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read graph snapshot {}: {}", path.display(), e))?;
        let snapshot: GraphSnapshot = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse graph snapshot: {}", e))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn insert_chart(&mut self, chart: Chart) {
        let id = chart.id;
        self.charts.entry(id).or_default().chart = Some(chart);
    }

    pub fn set_project(&mut self, project: ProjectContext) {
        self.projects.insert(project.project_id, project);
    }

    /// Add (or replace) a container slot in a chart.
    pub fn place(&mut self, chart: ChartId, container: ContainerId, node: Option<NodeId>) {
        let data = self.charts.entry(chart).or_default();
        data.containers.retain(|c| c.id != container);
        data.containers.push(Container { id: container, node_id: node });
    }

    pub fn link(&mut self, chart: ChartId, edge: Edge) {
        let data = self.charts.entry(chart).or_default();
        data.edges.retain(|e| e.id != edge.id);
        data.edges.push(edge);
    }
}

impl GraphAccessor for InMemoryGraph {
    fn get_node(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }

    fn get_chart(&self, id: ChartId) -> Option<Chart> {
        self.charts.get(&id).and_then(|d| d.chart.clone())
    }

    fn get_container(&self, chart: ChartId, container: ContainerId) -> Option<Container> {
        self.charts
            .get(&chart)?
            .containers
            .iter()
            .find(|c| c.id == container)
            .cloned()
    }

    fn chart_containers(&self, chart: ChartId) -> Vec<Container> {
        self.charts
            .get(&chart)
            .map(|d| d.containers.clone())
            .unwrap_or_default()
    }

    fn chart_edges(&self, chart: ChartId) -> Vec<Edge> {
        self.charts
            .get(&chart)
            .map(|d| d.edges.clone())
            .unwrap_or_default()
    }

    fn incoming_edges(&self, chart: ChartId, container: ContainerId) -> Vec<Edge> {
        self.charts
            .get(&chart)
            .map(|d| d.edges.iter().filter(|e| e.target == container).cloned().collect())
            .unwrap_or_default()
    }

    fn outgoing_edges(&self, chart: ChartId, container: ContainerId) -> Vec<Edge> {
        self.charts
            .get(&chart)
            .map(|d| d.edges.iter().filter(|e| e.source == container).cloned().collect())
            .unwrap_or_default()
    }

    fn project_context(&self, project: ProjectId) -> Option<ProjectContext> {
        self.projects.get(&project).cloned()
    }
}
