//! Typed errors for conditions callers are expected to match on.
//!
//! Everything else propagates as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown context strategy '{id}' (valid strategies: {})", valid.join(", "))]
    UnknownStrategy { id: String, valid: Vec<String> },

    #[error("context strategy '{0}' is valid but has not been registered")]
    StrategyNotRegistered(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("all {total} tasks failed; first error: {first_error}")]
    AllTasksFailed { total: usize, first_error: String },
}
