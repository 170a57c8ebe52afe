//! Bounded pool for per-batch work items
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

pub const MAX_BATCH_SIZE: usize = 10;

/// Runs at most `size` items at once. Each item's error or panic stays in that
/// item's slot; results come back in input order.
#[derive(Debug, Clone, Copy)]
pub struct BatchPool {
    size: usize,
}

impl BatchPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.clamp(1, MAX_BATCH_SIZE) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, worker: F) -> Vec<anyhow::Result<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        debug!("Batch pool running {} items with {} workers", items.len(), self.size);
        futures::stream::iter(items.into_iter().map(|item| AssertUnwindSafe(worker(item)).catch_unwind()))
            .buffered(self.size)
            .map(|outcome| match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Batch worker panicked: {}", message);
                    Err(anyhow::anyhow!("worker panicked: {}", message))
                }
            })
            .collect()
            .await
    }
}
