//! Exponential backoff with jitter, and the retry driver that distinguishes
//! retriable outcomes (re-thrown, scheduled for backoff) from bailed ones
//! (abort immediately, propagate as-is).
//!
//! The backoff math mirrors `hook_common::retry::RetryPolicy`; this version
//! adds jitter (the join driver and scheduler both rely on retries not all
//! waking in lockstep across many group members) and a `max_retries` ceiling,
//! since here retry exhaustion must itself become a terminal outcome rather
//! than running forever.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Exponential backoff parameters for a retried operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts before giving up. `0` means the
    /// operation is attempted exactly once, with no retries.
    pub max_retries: u32,
    /// Coefficient to multiply the initial interval by for every past
    /// attempt.
    pub backoff_coefficient: u32,
    /// Backoff interval for the first retry, before jitter.
    pub initial_interval: Duration,
    /// Ceiling on the backoff interval, before jitter.
    pub maximum_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(300),
            maximum_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// Interval for retrying at `attempt` (1-indexed), before jitter.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let candidate =
            self.initial_interval * self.backoff_coefficient.pow(attempt.saturating_sub(1));
        match self.maximum_interval {
            Some(max) => std::cmp::min(candidate, max),
            None => candidate,
        }
    }

    /// Same as `retry_interval`, with +/-15% jitter applied so that many
    /// runners backing off from the same broker incident don't retry in
    /// lockstep.
    pub fn retry_interval_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.retry_interval(attempt);
        let jitter = rand::thread_rng().gen_range(0.85_f64..1.15_f64);
        Duration::from_secs_f64((base.as_secs_f64() * jitter).max(0.0))
    }
}

/// Context threaded through a retried operation, replacing the implicit
/// closure state (retryCount, retryTime) of a callback-based retrier.
#[derive(Clone, Debug)]
pub struct RetryContext {
    pub attempt: u32,
    pub started_at: Instant,
}

impl RetryContext {
    fn new() -> Self {
        Self {
            attempt: 0,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// What a retried operation decided about its own failure: retriable
/// (schedule backoff and try again) or bailed (abort immediately).
pub enum RetryOutcome<E> {
    Retriable(E),
    Bail(E),
}

/// Drive `op` under `policy`: retry on `RetryOutcome::Retriable` with
/// exponential backoff and jitter, return immediately on
/// `RetryOutcome::Bail`, and surface the last error once `max_retries` is
/// exhausted.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = Result<T, RetryOutcome<E>>>,
{
    let mut ctx = RetryContext::new();
    loop {
        match op(ctx.clone()).await {
            Ok(value) => return Ok(value),
            Err(RetryOutcome::Bail(err)) => return Err(err),
            Err(RetryOutcome::Retriable(err)) => {
                if ctx.attempt >= policy.max_retries {
                    return Err(err);
                }
                ctx.attempt += 1;
                let delay = policy.retry_interval_with_jitter(ctx.attempt);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_interval_grows_with_coefficient() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: None,
        };
        assert_eq!(policy.retry_interval(1), Duration::from_millis(100));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(200));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_interval_caps_at_maximum() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: Some(Duration::from_millis(300)),
        };
        assert_eq!(policy.retry_interval(1), Duration::from_millis(100));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(200));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(300));
        assert_eq!(policy.retry_interval(10), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(1000),
            maximum_interval: None,
        };
        for _ in 0..50 {
            let d = policy.retry_interval_with_jitter(1);
            assert!(d.as_millis() >= 840 && d.as_millis() <= 1160);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bail_aborts_without_retrying() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), &'static str> = with_retry(&policy, |_ctx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryOutcome::Bail("fatal")) }
        })
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retriable_errors_are_retried_up_to_max() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_coefficient: 1,
            initial_interval: Duration::from_millis(1),
            maximum_interval: None,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), &'static str> = with_retry(&policy, |_ctx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryOutcome::Retriable("transient")) }
        })
        .await;
        assert_eq!(result, Err("transient"));
        // Initial attempt plus max_retries retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_coefficient: 1,
            initial_interval: Duration::from_millis(1),
            maximum_interval: None,
        };
        let attempts = AtomicU32::new(0);
        let result = with_retry(&policy, |_ctx| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RetryOutcome::Retriable("transient"))
                } else {
                    Ok::<_, &'static str>("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
