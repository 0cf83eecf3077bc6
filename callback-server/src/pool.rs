//! Bounded pool of connection handler tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// Runs at most `size` jobs at once.
///
/// Submitting never waits: each job is spawned immediately and waits for a
/// permit inside its own task, so the accept loop is never held up by busy
/// workers.
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
        }
    }

    pub(crate) fn submit<F>(&mut self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            // The semaphore is only closed by shutdown; queued jobs are dropped then.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Number of jobs running or waiting for a permit.
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next job to finish. Returns `None` when the pool is empty.
    pub(crate) async fn join_next(&mut self) -> Option<Result<(), JoinError>> {
        self.tasks.join_next().await
    }

    /// Stop accepting work, give running jobs `grace` to finish, then abort
    /// the rest.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        self.permits.close();

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Aborting connection handlers after shutdown grace period"
            );
            self.tasks.shutdown().await;
        }
    }
}

/// Log how a finished job ended. Cancelled jobs are expected during shutdown.
pub(crate) fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => warn!(error = %e, "Connection handler panicked"),
        Err(e) => debug!(error = %e, "Connection handler cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let mut pool = WorkerPool::new(1);
        let started = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = Arc::clone(&started);
        pool.submit(async move {
            first.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = Arc::clone(&started);
        pool.submit(async move {
            second.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 2);

        release_tx.send(()).unwrap();
        while let Some(joined) = pool.join_next().await {
            joined.unwrap();
        }
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_jobs_after_grace() {
        let mut pool = WorkerPool::new(2);
        pool.submit(std::future::pending::<()>());
        pool.submit(async {});

        let result =
            tokio::time::timeout(Duration::from_secs(2), pool.shutdown(Duration::from_millis(50)))
                .await;
        assert!(result.is_ok(), "shutdown must not wait for a stuck job");
    }

    #[tokio::test]
    async fn test_queued_jobs_are_dropped_on_shutdown() {
        let mut pool = WorkerPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        pool.submit(std::future::pending::<()>());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let counter = Arc::clone(&ran);
        pool.submit(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
