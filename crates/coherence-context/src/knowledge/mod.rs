//! Knowledge extractors: deterministic triples plus cached LLM facts and summaries
pub mod cache;
pub mod facts;
pub mod triples;

pub use cache::{CacheKey, CacheLookup, KnowledgeCache};
pub use facts::{parse_numbered_list, AtomicFact, FactExtractor, Provenance, Summary};
pub use triples::{
    compute_derived_triples, extract_triples, format_delta, KnowledgeTriple, Trend, TripleValue,
};
