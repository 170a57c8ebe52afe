//! LLM-backed atomic facts and summaries
use crate::capabilities::TextGenerator;
use crate::graph::{ChartId, Node, NodeId};
use crate::knowledge::cache::{CacheKey, KnowledgeCache};
use crate::memory_db::MemoryKind;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    static ref NUMBERED_ITEM: Regex = Regex::new(r"^\s*\d+\s*[.):-]\s*(.+?)\s*$").unwrap();
}

pub const DEFAULT_MIN_FACT_LENGTH: usize = 10;

const FACT_PROMPT: &str = "You extract atomic facts from a game design element.
Each fact must be a single, self-contained statement about the element.
Do not speculate beyond the text. Return only a numbered list, one fact per line.

Element:
{element}

Facts:";

const SUMMARY_PROMPT: &str = "Summarize the following game design element in one or two sentences.
Focus on what the player experiences and what changes. Return only the summary.

Element:
{element}

Summary:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Generated,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtomicFact {
    pub node_id: NodeId,
    pub text: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub node_id: NodeId,
    pub text: String,
    pub provenance: Provenance,
}

/// Parse `1. fact` / `2) fact` lines, dropping items shorter than `min_length`.
pub fn parse_numbered_list(response: &str, min_length: usize) -> Vec<String> {
    response
        .lines()
        .filter_map(|line| NUMBERED_ITEM.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|fact| fact.chars().count() >= min_length)
        .collect()
}

pub struct FactExtractor {
    generator: Option<Arc<dyn TextGenerator>>,
    cache: Arc<KnowledgeCache>,
    min_length: usize,
}

impl FactExtractor {
    pub fn new(
        generator: Option<Arc<dyn TextGenerator>>,
        cache: Arc<KnowledgeCache>,
        min_length: usize,
    ) -> Self {
        Self { generator, cache, min_length }
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Uncached extraction. A missing generator yields no facts.
    pub async fn try_extract_facts(&self, node: &Node) -> anyhow::Result<Vec<String>> {
        let Some(generator) = &self.generator else {
            debug!("No text generator configured, skipping fact extraction for node {}", node.id);
            return Ok(Vec::new());
        };
        let prompt = FACT_PROMPT.replace("{element}", &node.describe());
        let response = generator.generate(&prompt).await?;
        let facts = parse_numbered_list(&response, self.min_length);
        debug!("Extracted {} facts for node {}", facts.len(), node.id);
        Ok(facts)
    }

    pub async fn try_summarize(&self, node: &Node) -> anyhow::Result<Vec<String>> {
        let Some(generator) = &self.generator else {
            return Ok(Vec::new());
        };
        let prompt = SUMMARY_PROMPT.replace("{element}", &node.describe());
        let response = generator.generate(&prompt).await?;
        let summary = response.trim();
        Ok(if summary.is_empty() { Vec::new() } else { vec![summary.to_string()] })
    }

    /// Cache-aside fact lookup; failures propagate so batch callers can record them.
    pub async fn facts_checked(&self, node: &Node, collection: ChartId) -> anyhow::Result<Vec<AtomicFact>> {
        let key = CacheKey::new(node.id, collection, MemoryKind::Fact);
        let lookup = self.cache.get_or_compute(key, || self.try_extract_facts(node)).await?;
        let provenance = if lookup.from_cache { Provenance::Cached } else { Provenance::Generated };
        Ok(lookup
            .texts
            .into_iter()
            .map(|text| AtomicFact { node_id: node.id, text, provenance })
            .collect())
    }

    /// Like [`facts_checked`](Self::facts_checked) but degrades to an empty list.
    pub async fn facts_for(&self, node: &Node, collection: ChartId) -> Vec<AtomicFact> {
        match self.facts_checked(node, collection).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!("Fact extraction failed for node {}: {}", node.id, e);
                Vec::new()
            }
        }
    }

    pub async fn summary_for(&self, node: &Node, collection: ChartId) -> Option<Summary> {
        let key = CacheKey::new(node.id, collection, MemoryKind::Summary);
        match self.cache.get_or_compute(key, || self.try_summarize(node)).await {
            Ok(lookup) => {
                let provenance = if lookup.from_cache { Provenance::Cached } else { Provenance::Generated };
                lookup.texts.into_iter().next().map(|text| Summary { node_id: node.id, text, provenance })
            }
            Err(e) => {
                warn!("Summary generation failed for node {}: {}", node.id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{MemoryDatabase, SimilarityMode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedGenerator {
        response: anyhow::Result<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn extractor(response: anyhow::Result<String>) -> (FactExtractor, Arc<ScriptedGenerator>) {
        let generator = Arc::new(ScriptedGenerator { response, calls: AtomicUsize::new(0) });
        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Exact).unwrap());
        let cache = Arc::new(KnowledgeCache::new(db));
        let dyn_generator: Arc<dyn TextGenerator> = generator.clone();
        (FactExtractor::new(Some(dyn_generator), cache, DEFAULT_MIN_FACT_LENGTH), generator)
    }

    #[test]
    fn test_parse_numbered_list() {
        let response = "Here are the facts:\n1. The bridge is made of rope.\n2) Short\n  3 - The river below is fast flowing.\n- not numbered fact line";
        assert_eq!(
            parse_numbered_list(response, 10),
            vec!["The bridge is made of rope.", "The river below is fast flowing."]
        );
    }

    #[tokio::test]
    async fn test_facts_are_cached_after_first_call() {
        let (extractor, generator) = extractor(Ok("1. The player finds a silver key.".into()));
        let node = Node::new(1, 1, "Cellar");
        let first = extractor.facts_for(&node, 1).await;
        let second = extractor.facts_for(&node, 1).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].provenance, Provenance::Generated);
        assert_eq!(second[0].provenance, Provenance::Cached);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_degrades_to_empty() {
        let (extractor, _) = extractor(Err(anyhow::anyhow!("timeout")));
        let node = Node::new(1, 1, "Cellar");
        assert!(extractor.facts_for(&node, 1).await.is_empty());
        assert!(extractor.facts_checked(&node, 1).await.is_err());
        assert!(extractor.summary_for(&node, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_generator_yields_nothing() {
        let db = Arc::new(MemoryDatabase::new_in_memory(SimilarityMode::Exact).unwrap());
        let extractor = FactExtractor::new(None, Arc::new(KnowledgeCache::new(db)), 10);
        let node = Node::new(1, 1, "Cellar");
        assert!(extractor.facts_checked(&node, 1).await.unwrap().is_empty());
        assert!(extractor.summary_for(&node, 1).await.is_none());
    }
}
