//! Query -> search -> refine loop over the memory store
use crate::capabilities::{Embedder, TextGenerator};
use crate::memory_db::{MemoryDatabase, ScoredMemory, SearchFilters};
use crate::utils::TextUtils;
use crate::worker_threads::Cancellation;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const REFINE_PROMPT: &str = "You refine search queries over a game design memory store.
Current query: {query}

Relevant findings so far:
{hints}

Write one improved search query that would surface related design facts not yet found.
Return only the query text.";

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub max_iterations: usize,
    pub top_k: usize,
    /// Results handed to the refiner as hints
    pub hint_count: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            top_k: 5,
            hint_count: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationLimit,
    NoResults,
    NoRefiner,
    RefinementFailed,
    QueryUnchanged,
    EmbeddingFailed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    /// Deduplicated by record id, in discovery order
    pub records: Vec<ScoredMemory>,
    /// Every query that was actually searched
    pub queries: Vec<String>,
    pub iterations: usize,
    pub stop_reason: StopReason,
}

impl RetrievalOutcome {
    pub fn cancelled(&self) -> bool {
        self.stop_reason == StopReason::Cancelled
    }
}

pub struct IterativeRetriever {
    database: Arc<MemoryDatabase>,
    embedder: Arc<dyn Embedder>,
    refiner: Option<Arc<dyn TextGenerator>>,
    config: RetrieverConfig,
}

impl IterativeRetriever {
    pub fn new(
        database: Arc<MemoryDatabase>,
        embedder: Arc<dyn Embedder>,
        refiner: Option<Arc<dyn TextGenerator>>,
        config: RetrieverConfig,
    ) -> Self {
        Self { database, embedder, refiner, config }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        filters: &SearchFilters,
        cancel: &Cancellation,
    ) -> RetrievalOutcome {
        let mut seen: HashSet<String> = HashSet::new();
        let mut records = Vec::new();
        let mut queries = Vec::new();
        let mut iterations = 0;
        let mut current = TextUtils::normalize_whitespace(query).into_owned();
        let mut stop_reason = StopReason::IterationLimit;

        while iterations < self.config.max_iterations {
            if cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            let embedding = match cancel.guard(self.embedder.embed(&current)).await {
                None => {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
                Some(Err(e)) => {
                    warn!("Query embedding failed, ending retrieval: {}", e);
                    stop_reason = StopReason::EmbeddingFailed;
                    break;
                }
                Some(Ok(embedding)) => embedding,
            };

            queries.push(current.clone());
            iterations += 1;
            let results = self
                .database
                .memories
                .search_similar(&embedding, self.config.top_k, filters);
            let hints: Vec<String> = results
                .iter()
                .take(self.config.hint_count)
                .map(|r| r.record.content.clone())
                .collect();
            let before = records.len();
            for result in results {
                if seen.insert(result.record.id.clone()) {
                    records.push(result);
                }
            }
            debug!(
                "Retrieval iteration {} for '{}': {} new records",
                iterations,
                current,
                records.len() - before
            );

            if iterations >= self.config.max_iterations {
                break;
            }
            if hints.is_empty() {
                stop_reason = StopReason::NoResults;
                break;
            }
            let Some(refiner) = &self.refiner else {
                stop_reason = StopReason::NoRefiner;
                break;
            };

            let prompt = REFINE_PROMPT
                .replace("{query}", &current)
                .replace("{hints}", &hints.iter().map(|h| format!("- {}", h)).collect::<Vec<_>>().join("\n"));
            let refined = match cancel.guard(refiner.generate(&prompt)).await {
                None => {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
                Some(Err(e)) => {
                    warn!("Query refinement failed, keeping {} records: {}", records.len(), e);
                    stop_reason = StopReason::RefinementFailed;
                    break;
                }
                Some(Ok(text)) => clean_query(&text),
            };
            if refined.is_empty() || refined.eq_ignore_ascii_case(&current) {
                stop_reason = StopReason::QueryUnchanged;
                break;
            }
            current = refined;
        }

        RetrievalOutcome { records, queries, iterations, stop_reason }
    }
}

fn clean_query(raw: &str) -> String {
    let first_line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let trimmed = first_line
        .trim()
        .trim_start_matches("Query:")
        .trim()
        .trim_matches(|c| c == '"' || c == '\'');
    TextUtils::normalize_whitespace(trimmed).into_owned()
}
