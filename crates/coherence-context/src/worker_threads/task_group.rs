//! Semaphore-bounded fan-out of independent tasks
use crate::error::EngineError;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome<T> {
    pub index: usize,
    pub label: String,
    /// Error text for failed tasks
    pub result: Result<T, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanOutReport<T> {
    pub outcomes: Vec<TaskOutcome<T>>,
    pub succeeded: usize,
    pub failed: usize,
    /// False only when every task failed
    pub success: bool,
}

impl<T> FanOutReport<T> {
    pub fn errors(&self) -> impl Iterator<Item = &TaskOutcome<T>> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Launches every task at once, lets at most `limit` run concurrently, and
/// awaits them all. Only "all tasks failed" is reported as an error.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl TaskGroup {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn run<T, Fut>(&self, tasks: Vec<(String, Fut)>) -> Result<FanOutReport<T>, EngineError>
    where
        T: Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let total = tasks.len();
        let mut handles = Vec::with_capacity(total);
        for (index, (label, task)) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Err(anyhow::anyhow!("task semaphore closed: {}", e)),
                };
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("task panicked")),
                }
            });
            handles.push((index, label, handle));
        }

        let mut outcomes = Vec::with_capacity(total);
        for (index, label, handle) in handles {
            let result = match handle.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(join_error) => Err(format!("task aborted: {}", join_error)),
            };
            if let Err(e) = &result {
                warn!("Task {} ({}) failed: {}", index, label, e);
            }
            outcomes.push(TaskOutcome { index, label, result });
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        let succeeded = total - failed;
        if total > 0 && failed == total {
            let first_error = outcomes
                .iter()
                .find_map(|o| o.result.as_ref().err().cloned())
                .unwrap_or_default();
            return Err(EngineError::AllTasksFailed { total, first_error });
        }
        info!("Fan-out finished: {} succeeded, {} failed", succeeded, failed);
        Ok(FanOutReport { outcomes, succeeded, failed, success: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn evaluation(n: usize) -> BoxFuture<'static, anyhow::Result<usize>> {
        Box::pin(async move {
            if n == 3 {
                anyhow::bail!("generation call for node {} failed", n);
            }
            Ok(n)
        })
    }

    #[tokio::test]
    async fn test_partial_failure_is_not_fatal() {
        let group = TaskGroup::new(2);
        let tasks = (1..=5).map(|n| (format!("node-{}", n), evaluation(n))).collect();
        let report = group.run(tasks).await.unwrap();
        assert!(report.success);
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);
        let failure = report.errors().next().unwrap();
        assert_eq!(failure.label, "node-3");
        assert!(failure.result.as_ref().unwrap_err().contains("node 3"));
    }

    #[tokio::test]
    async fn test_all_failed_escalates() {
        let group = TaskGroup::new(4);
        let tasks: Vec<(String, BoxFuture<'static, anyhow::Result<()>>)> = (0..3)
            .map(|n| {
                let fut: BoxFuture<'static, anyhow::Result<()>> =
                    Box::pin(async move { Err::<(), _>(anyhow::anyhow!("down {}", n)) });
                (n.to_string(), fut)
            })
            .collect();
        let err = group.run(tasks).await.unwrap_err();
        assert!(matches!(err, EngineError::AllTasksFailed { total: 3, .. }));
    }

    #[tokio::test]
    async fn test_limit_bounds_concurrency() {
        let group = TaskGroup::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..6)
            .map(|n| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                });
                (n.to_string(), fut)
            })
            .collect();
        let report = group.run(tasks).await.unwrap();
        assert_eq!(report.succeeded, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_fan_out_succeeds() {
        let group = TaskGroup::new(2);
        let report = group.run(Vec::<(String, BoxFuture<'static, anyhow::Result<()>>)>::new()).await.unwrap();
        assert!(report.success);
        assert!(report.outcomes.is_empty());
    }
}
