//! Concurrency primitives and the capability client

pub mod batch_pool;
pub mod cancellation;
pub mod llm_worker;
pub mod task_group;

pub use batch_pool::{BatchPool, MAX_BATCH_SIZE};
pub use cancellation::Cancellation;
pub use llm_worker::LlamaServerClient;
pub use task_group::{FanOutReport, TaskGroup, TaskOutcome};
