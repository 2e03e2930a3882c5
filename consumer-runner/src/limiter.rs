//! Bounded parallel execution of per-partition batch processing.
//!
//! `limit >= 1` tasks run concurrently; the rest queue in FIFO order.
//! `tokio::sync::Semaphore` already wakes waiters in the order they called
//! `acquire`, so admission order falls out of the primitive rather than
//! needing a hand-rolled queue. A rejected task releases its permit as soon
//! as its future resolves (the `OwnedSemaphorePermit` guard drops at the end
//! of the spawned task regardless of outcome), so the next queued task is
//! admitted immediately.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 1, "partitions_consumed_concurrently must be >= 1");
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Admit `task` once a permit is free; returns a handle that resolves
    /// with the task's own output once it completes. `limit = 1` degenerates
    /// to strict serial execution because only one permit ever exists.
    pub fn submit<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("concurrency limiter semaphore closed unexpectedly");
            task.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn admits_at_most_limit_concurrently() {
        let limiter = ConcurrencyLimiter::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            handles.push(limiter.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn serial_execution_at_limit_one() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            handles.push(limiter.submit(async move {
                order.lock().await.push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn a_failing_task_releases_its_permit_immediately() {
        let limiter = ConcurrencyLimiter::new(1);
        let notify = Arc::new(Notify::new());

        let failing = limiter.submit(async { panic!("boom") });
        // A panicking task still drops its permit guard on unwind.
        let _ = failing.await;

        let notify2 = notify.clone();
        let next = limiter.submit(async move {
            notify2.notify_one();
        });
        tokio::time::timeout(Duration::from_millis(200), notify.notified())
            .await
            .expect("next task should have been admitted after the failing one released its permit");
        next.await.unwrap();
    }
}
