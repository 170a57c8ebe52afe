use crate::context_engine::{GeneratorOptions, RetrieverConfig, StrategyConfig};
use crate::error::EngineError;
use crate::graph::TraversalLimits;
use crate::memory_db::SimilarityMode;
use crate::worker_threads::MAX_BATCH_SIZE;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub llm_backend_url: String,
    pub llm_model: String,
    pub embedding_model: String,
    pub request_timeout_seconds: u64,
    pub max_concurrent_tasks: usize,
    pub generation_batch_size: usize,
    pub retrieval_iterations: usize,
    pub retrieval_top_k: usize,
    pub retrieval_hints: usize,
    pub traversal_max_depth: usize,
    pub similarity_mode: SimilarityMode,
    pub fact_min_length: usize,
    pub skip_fact_extraction: bool,
    pub max_context_chars: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn read<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
            F: Fn(&str) -> Option<String>,
        {
            match lookup(key) {
                Some(raw) if !raw.trim().is_empty() => raw
                    .trim()
                    .parse::<T>()
                    .map_err(|e| anyhow::anyhow!("{}", e))
                    .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
                _ => Ok(default),
            }
        }

        let max_concurrent_tasks = read(&lookup, "MAX_CONCURRENT_TASKS", Self::auto_detect_concurrency())?;
        let generation_batch_size: usize = read(&lookup, "GENERATION_BATCH_SIZE", MAX_BATCH_SIZE)?;

        let config = Self {
            database_path: read(&lookup, "DATABASE_PATH", "./data/coherence_memory.db".to_string())?,
            llm_backend_url: read(&lookup, "LLM_BACKEND_URL", "http://127.0.0.1:8081".to_string())?,
            llm_model: read(&lookup, "LLM_MODEL", "local-llm".to_string())?,
            embedding_model: read(&lookup, "EMBEDDING_MODEL", "local-llm".to_string())?,
            request_timeout_seconds: read(&lookup, "REQUEST_TIMEOUT_SECONDS", 120)?,
            max_concurrent_tasks,
            generation_batch_size: generation_batch_size.clamp(1, MAX_BATCH_SIZE),
            retrieval_iterations: read(&lookup, "RETRIEVAL_ITERATIONS", 3)?,
            retrieval_top_k: read(&lookup, "RETRIEVAL_TOP_K", 5)?,
            retrieval_hints: read(&lookup, "RETRIEVAL_HINTS", 3)?,
            traversal_max_depth: read(&lookup, "TRAVERSAL_MAX_DEPTH", 25)?,
            similarity_mode: read(&lookup, "SIMILARITY_MODE", SimilarityMode::Native)?,
            fact_min_length: read(&lookup, "FACT_MIN_LENGTH", 10)?,
            skip_fact_extraction: read(&lookup, "SKIP_FACT_EXTRACTION", false)?,
            max_context_chars: read(&lookup, "MAX_CONTEXT_CHARS", 16_000)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn auto_detect_concurrency() -> usize {
        let cores = num_cpus::get();
        let tasks = cores.clamp(2, 16);
        info!("Auto-detected CPU cores: {} (task concurrency {})", cores, tasks);
        tasks
    }

    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.llm_backend_url.trim().is_empty() {
            return Err(EngineError::InvalidConfig("LLM_BACKEND_URL must not be empty".into()));
        }
        if !(self.llm_backend_url.starts_with("http://") || self.llm_backend_url.starts_with("https://")) {
            return Err(EngineError::InvalidConfig(format!(
                "LLM_BACKEND_URL must be an http(s) URL, got '{}'",
                self.llm_backend_url
            )));
        }
        if self.database_path.trim().is_empty() {
            return Err(EngineError::InvalidConfig("DATABASE_PATH must not be empty".into()));
        }
        if self.retrieval_iterations == 0 {
            return Err(EngineError::InvalidConfig("RETRIEVAL_ITERATIONS must be at least 1".into()));
        }
        if self.retrieval_top_k == 0 {
            return Err(EngineError::InvalidConfig("RETRIEVAL_TOP_K must be at least 1".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::InvalidConfig("MAX_CONCURRENT_TASKS must be at least 1".into()));
        }
        if self.traversal_max_depth == 0 {
            return Err(EngineError::InvalidConfig("TRAVERSAL_MAX_DEPTH must be at least 1".into()));
        }
        if self.request_timeout_seconds == 0 {
            return Err(EngineError::InvalidConfig("REQUEST_TIMEOUT_SECONDS must be at least 1".into()));
        }
        Ok(())
    }

    pub fn traversal_limits(&self) -> TraversalLimits {
        TraversalLimits {
            max_depth: self.traversal_max_depth,
            ..TraversalLimits::default()
        }
    }

    pub fn retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig {
            max_iterations: self.retrieval_iterations,
            top_k: self.retrieval_top_k,
            hint_count: self.retrieval_hints,
        }
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            batch_size: self.generation_batch_size,
            skip_facts: self.skip_fact_extraction,
            ..GeneratorOptions::default()
        }
    }

    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            traversal: self.traversal_limits(),
            retriever: self.retriever_config(),
            skip_fact_extraction: self.skip_fact_extraction,
            fact_min_length: self.fact_min_length,
            max_context_chars: self.max_context_chars,
            ..StrategyConfig::default()
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database Path: {}", self.database_path);
        info!("- LLM Backend: {}", self.llm_backend_url);
        info!("- Models: {} / {} (embeddings)", self.llm_model, self.embedding_model);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Max Concurrent Tasks: {}", self.max_concurrent_tasks);
        info!("- Generation Batch Size: {}", self.generation_batch_size);
        info!(
            "- Retrieval: {} iterations, top {}, {} hints",
            self.retrieval_iterations, self.retrieval_top_k, self.retrieval_hints
        );
        info!("- Traversal Max Depth: {}", self.traversal_max_depth);
        info!("- Similarity Mode: {}", self.similarity_mode);
        info!("- Fact Extraction: {}", if self.skip_fact_extraction { "skipped" } else { "enabled" });
        info!("- Max Context Chars: {}", self.max_context_chars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    fn create_test_config() -> Config {
        from_pairs(&[("MAX_CONCURRENT_TASKS", "4")]).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = create_test_config();
        assert_eq!(config.llm_backend_url, "http://127.0.0.1:8081");
        assert_eq!(config.generation_batch_size, 10);
        assert_eq!(config.retrieval_iterations, 3);
        assert_eq!(config.similarity_mode, SimilarityMode::Native);
        assert!(!config.skip_fact_extraction);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = from_pairs(&[
            ("SIMILARITY_MODE", "exact"),
            ("RETRIEVAL_TOP_K", "8"),
            ("SKIP_FACT_EXTRACTION", "true"),
            ("DATABASE_PATH", "/tmp/memory.db"),
        ])
        .unwrap();
        assert_eq!(config.similarity_mode, SimilarityMode::Exact);
        assert_eq!(config.retrieval_top_k, 8);
        assert!(config.skip_fact_extraction);
        assert_eq!(config.database_path, "/tmp/memory.db");
    }

    #[test]
    fn test_batch_size_is_clamped() {
        assert_eq!(from_pairs(&[("GENERATION_BATCH_SIZE", "64")]).unwrap().generation_batch_size, 10);
        assert_eq!(from_pairs(&[("GENERATION_BATCH_SIZE", "0")]).unwrap().generation_batch_size, 1);
    }

    #[test]
    fn test_auto_detect_concurrency_in_range() {
        let tasks = Config::auto_detect_concurrency();
        assert!((2..=16).contains(&tasks));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert_err!(from_pairs(&[("RETRIEVAL_TOP_K", "many")]));
        assert_err!(from_pairs(&[("SIMILARITY_MODE", "hnsw")]));
        assert_err!(from_pairs(&[("RETRIEVAL_ITERATIONS", "0")]));
        assert_err!(from_pairs(&[("LLM_BACKEND_URL", "ftp://host")]));
    }

    #[test]
    fn test_validate_reports_invalid_config() {
        let mut config = create_test_config();
        config.retrieval_iterations = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(err.to_string().contains("RETRIEVAL_ITERATIONS"));
    }

    #[test]
    fn test_derived_component_configs() {
        let config = from_pairs(&[("TRAVERSAL_MAX_DEPTH", "7"), ("RETRIEVAL_HINTS", "2")]).unwrap();
        assert_eq!(config.traversal_limits().max_depth, 7);
        assert_eq!(config.retriever_config().hint_count, 2);
        assert_eq!(config.strategy_config().traversal.max_depth, 7);
        assert_eq!(config.generator_options().batch_size, config.generation_batch_size);
    }
}
