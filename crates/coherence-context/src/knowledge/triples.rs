//! Deterministic (head, relation, tail) extraction from attributes and edges
use crate::graph::{AttributeValue, Node};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TripleValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&AttributeValue> for TripleValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(b) => TripleValue::Bool(*b),
            AttributeValue::Number(n) => TripleValue::Number(*n),
            AttributeValue::Text(s) => TripleValue::Text(s.clone()),
        }
    }
}

impl fmt::Display for TripleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripleValue::Bool(b) => write!(f, "{}", b),
            TripleValue::Number(n) => write!(f, "{}", format_number(*n)),
            TripleValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeTriple {
    pub head: String,
    pub relation: String,
    pub tail: TripleValue,
}

impl KnowledgeTriple {
    pub fn new(head: impl Into<String>, relation: impl Into<String>, tail: TripleValue) -> Self {
        Self {
            head: head.into(),
            relation: relation.into(),
            tail,
        }
    }

    /// One-line rendering used for embedding and context sections
    pub fn to_text(&self) -> String {
        format!("({}, {}, {})", self.head, self.relation, self.tail)
    }
}

/// Bucket of a numeric change between two neighbouring nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Spike,
    Rise,
    Stable,
    Fall,
    Drop,
}

impl Trend {
    pub const SPIKE_THRESHOLD: f64 = 50.0;
    pub const RISE_THRESHOLD: f64 = 20.0;

    pub fn classify(delta: f64) -> Self {
        if delta > Self::SPIKE_THRESHOLD {
            Trend::Spike
        } else if delta < -Self::SPIKE_THRESHOLD {
            Trend::Drop
        } else if delta > Self::RISE_THRESHOLD {
            Trend::Rise
        } else if delta < -Self::RISE_THRESHOLD {
            Trend::Fall
        } else {
            Trend::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Spike => "spike",
            Trend::Rise => "rise",
            Trend::Stable => "stable",
            Trend::Fall => "fall",
            Trend::Drop => "drop",
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{:.2}", n)
    }
}

/// Signed delta with an explicit `+` for growth, e.g. `+65` or `-12.50`.
pub fn format_delta(delta: f64) -> String {
    if delta >= 0.0 {
        format!("+{}", format_number(delta))
    } else {
        format_number(delta)
    }
}

/// Triples describing one node: its description, every attribute, and a
/// `leads_to` / `follows` triple per neighbour.
pub fn extract_triples(node: &Node, previous: &[Node], next: &[Node]) -> Vec<KnowledgeTriple> {
    let mut triples = Vec::with_capacity(node.attributes.len() + previous.len() + next.len() + 1);
    if !node.description.trim().is_empty() {
        triples.push(KnowledgeTriple::new(
            &node.name,
            "described_as",
            TripleValue::Text(node.description.trim().to_string()),
        ));
    }
    for attr in &node.attributes {
        triples.push(KnowledgeTriple::new(
            &node.name,
            attr.name.to_lowercase().replace(' ', "_"),
            TripleValue::from(&attr.value),
        ));
    }
    for prev in previous {
        triples.push(KnowledgeTriple::new(&node.name, "follows", TripleValue::Text(prev.name.clone())));
    }
    for succ in next {
        triples.push(KnowledgeTriple::new(&node.name, "leads_to", TripleValue::Text(succ.name.clone())));
    }
    triples
}

/// Transition triples between `target` and each neighbour, oriented along the
/// edge direction (`prev -> target`, `target -> next`).
///
/// Only attributes present on both sides are compared. Numbers yield a
/// `{attr}_transition` triple with a trend and signed delta; text and boolean
/// values yield a `{attr}_change` triple when they differ.
pub fn compute_derived_triples(target: &Node, previous: &[Node], next: &[Node]) -> Vec<KnowledgeTriple> {
    let mut triples = Vec::new();
    for prev in previous {
        triples.extend(transition_triples(prev, target));
    }
    for succ in next {
        triples.extend(transition_triples(target, succ));
    }
    triples
}

fn transition_triples(from: &Node, to: &Node) -> Vec<KnowledgeTriple> {
    let head = format!("{} -> {}", from.name, to.name);
    let mut triples = Vec::new();
    for attr in &from.attributes {
        let Some(other) = to.attribute(&attr.name) else {
            continue;
        };
        let key = attr.name.to_lowercase().replace(' ', "_");
        match (attr.value.as_number(), other.as_number()) {
            (Some(a), Some(b)) => {
                let delta = b - a;
                let trend = Trend::classify(delta);
                triples.push(KnowledgeTriple::new(
                    &head,
                    format!("{}_transition", key),
                    TripleValue::Text(format!("{} ({})", trend.as_str(), format_delta(delta))),
                ));
            }
            _ => {
                if &attr.value != other {
                    triples.push(KnowledgeTriple::new(
                        &head,
                        format!("{}_change", key),
                        TripleValue::Text(format!("'{}' -> '{}'", attr.value, other)),
                    ));
                }
            }
        }
    }
    triples
}
