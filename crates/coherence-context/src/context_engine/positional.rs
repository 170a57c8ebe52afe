//! Positional index keys: `L{layer}.{project}.{chart}.{path-hash}.{node}`
//!
//! Layer 1 keeps only the project, layer 2 adds the chart, layer 3 the path
//! hash and layer 4 the node. Dropping the last segment yields the parent.
use crate::graph::{ChartId, NodeId, ProjectId};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionalIndex {
    pub layer: u8,
    pub project: ProjectId,
    pub chart: Option<ChartId>,
    pub path_hash: Option<String>,
    pub node: Option<NodeId>,
}

impl PositionalIndex {
    pub fn domain(project: ProjectId) -> Self {
        Self { layer: 1, project, chart: None, path_hash: None, node: None }
    }

    pub fn category(project: ProjectId, chart: ChartId) -> Self {
        Self { layer: 2, chart: Some(chart), ..Self::domain(project) }
    }

    pub fn trace(project: ProjectId, chart: ChartId, path_hash: impl Into<String>) -> Self {
        Self {
            layer: 3,
            path_hash: Some(path_hash.into()),
            ..Self::category(project, chart)
        }
    }

    pub fn episode(project: ProjectId, chart: ChartId, path_hash: impl Into<String>, node: NodeId) -> Self {
        Self {
            layer: 4,
            node: Some(node),
            ..Self::trace(project, chart, path_hash)
        }
    }

    /// Index of the enclosing layer-minus-one context
    pub fn parent(&self) -> Option<Self> {
        let mut parent = self.clone();
        match self.layer {
            1 => return None,
            2 => parent.chart = None,
            3 => parent.path_hash = None,
            _ => parent.node = None,
        }
        parent.layer -= 1;
        Some(parent)
    }

    /// Prefix matching every direct child of this index
    pub fn child_prefix(&self) -> String {
        let rendered = self.to_string();
        let rest = rendered.split_once('.').map(|(_, rest)| rest).unwrap_or("");
        format!("L{}.{}.", self.layer + 1, rest)
    }
}

/// Short stable hash of a node path
pub fn path_hash(node_ids: &[NodeId]) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in node_ids {
        hasher.update(&id.to_le_bytes());
    }
    hasher.finalize().to_hex()[..12].to_string()
}

impl fmt::Display for PositionalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}.{}", self.layer, self.project)?;
        if let Some(chart) = self.chart {
            write!(f, ".{}", chart)?;
        }
        if let Some(hash) = &self.path_hash {
            write!(f, ".{}", hash)?;
        }
        if let Some(node) = self.node {
            write!(f, ".{}", node)?;
        }
        Ok(())
    }
}

impl FromStr for PositionalIndex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let layer: u8 = parts
            .first()
            .and_then(|p| p.strip_prefix('L'))
            .and_then(|l| l.parse().ok())
            .filter(|l| (1..=4).contains(l))
            .ok_or_else(|| anyhow::anyhow!("Invalid positional index layer in '{}'", s))?;
        if parts.len() != layer as usize + 1 {
            return Err(anyhow::anyhow!("Positional index '{}' has wrong segment count for layer {}", s, layer));
        }
        let project = parts[1].parse()?;
        let chart = parts.get(2).map(|c| c.parse()).transpose()?;
        let path_hash = parts.get(3).map(|h| h.to_string());
        let node = parts.get(4).map(|n| n.parse()).transpose()?;
        Ok(Self { layer, project, chart, path_hash, node })
    }
}
