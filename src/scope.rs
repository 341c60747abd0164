//! Scope-ending events and the bounded cleanup barrier.
//!
//! Cancelling a scope is a group operation: every inflight request tagged
//! with the scope is cancelled, subscribers are told the scope is ending,
//! and cancellation then waits — briefly — for whatever cleanup the
//! subscribers scheduled. The wait is bounded: a hung observer delays
//! cancellation by at most the barrier timeout, never forever.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use tracing::warn;

use crate::key::RequestKey;

/// Default bound on how long a scope cancellation waits for cleanup.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

/// A subscriber to scope lifecycle events.
///
/// Observers may schedule asynchronous cleanup on the provided
/// [`CleanupBarrier`]; the engine awaits the barrier (bounded) before the
/// cancellation call returns.
#[async_trait]
pub trait ScopeObserver: Send + Sync {
    /// A scope is ending; `keys` are the requests being cancelled with it.
    ///
    /// Runs inline on the cancellation path. Long-running work belongs on
    /// the barrier, not in this call.
    async fn scope_ending(&self, scope: &str, keys: &[RequestKey], barrier: &CleanupBarrier);
}

/// Collects cleanup futures and awaits them with a bounded timeout.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use reqkit::scope::CleanupBarrier;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let barrier = CleanupBarrier::new();
/// barrier.add_task(async { /* flush, log, release */ });
/// assert!(barrier.wait(Duration::from_secs(1)).await);
/// # });
/// ```
#[derive(Default)]
pub struct CleanupBarrier {
    tasks: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl CleanupBarrier {
    /// Creates an empty barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a cleanup future to run inside [`wait`](Self::wait).
    pub fn add_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .expect("cleanup barrier mutex poisoned")
            .push(Box::pin(task));
    }

    /// Number of tasks currently scheduled.
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .expect("cleanup barrier mutex poisoned")
            .len()
    }

    /// `true` when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains and runs every scheduled task, waiting at most `limit`.
    ///
    /// Returns `true` when all tasks finished in time. On timeout the
    /// stragglers are dropped and cancellation proceeds anyway.
    pub async fn wait(&self, limit: Duration) -> bool {
        let tasks = {
            let mut guard = self
                .tasks
                .lock()
                .expect("cleanup barrier mutex poisoned");
            std::mem::take(&mut *guard)
        };
        if tasks.is_empty() {
            return true;
        }

        let count = tasks.len();
        match tokio::time::timeout(limit, join_all(tasks)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    tasks = count,
                    timeout_ms = limit.as_millis() as u64,
                    "cleanup barrier timed out — proceeding"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_all_scheduled_tasks() {
        let barrier = CleanupBarrier::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            barrier.add_task(async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(barrier.wait(Duration::from_secs(1)).await);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(barrier.is_empty());
    }

    #[tokio::test]
    async fn hung_task_does_not_block_past_the_limit() {
        let barrier = CleanupBarrier::new();
        barrier.add_task(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = std::time::Instant::now();
        let completed = barrier.wait(Duration::from_millis(50)).await;

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_barrier_returns_immediately() {
        let barrier = CleanupBarrier::new();
        assert!(barrier.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn wait_drains_tasks_once() {
        let barrier = CleanupBarrier::new();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        barrier.add_task(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        barrier.wait(Duration::from_secs(1)).await;
        barrier.wait(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
