//! Cooperative cancellation with an optional deadline
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
}

/// Cloneable signal checked by every iterative or batch loop.
///
/// Loops stop at the next check and return what they have accumulated.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Some(deadline),
                ..Default::default()
            }),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Resolves once cancelled or past the deadline.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => return,
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Run `fut` unless cancellation fires first; `None` means it was cut short.
    pub async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_completes_when_not_cancelled() {
        let cancel = Cancellation::new();
        assert_eq!(cancel.guard(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let out = cancel.guard(std::future::pending::<()>()).await;
        assert!(out.is_none());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let cancel = Cancellation::with_timeout(Duration::from_millis(10));
        let out = cancel.guard(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(out.is_none());
    }
}
