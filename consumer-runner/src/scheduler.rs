//! Fetch Loop Scheduler: the long-running loop that calls `fetch()`,
//! classifies whatever error comes back, and decides whether to recover by
//! re-joining, swallow and continue, or bail out to the crash handler.
//!
//! Recovery table (mirrors the component design's error-handling section):
//!   REBALANCE_IN_PROGRESS / NOT_COORDINATOR_FOR_GROUP -> re-join, continue
//!   UNKNOWN_MEMBER_ID -> clear member id, re-join, continue
//!   KafkaJSOffsetOutOfRange -> swallow, continue (collaborator repositioned)
//!   KafkaJSNotImplemented -> bail
//!   anything else -> retry under the policy, then bail once exhausted

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{GroupError, KafkaErrorKind, RunnerError};
use crate::events::{FetchEvent, InstrumentationEmitter};
use crate::group::{Batch, ConsumerGroup};
use crate::join;
use crate::retry::{with_retry, RetryOutcome, RetryPolicy};

/// Outcome of a single scheduler iteration.
pub enum StepOutcome {
    /// New batches to dispatch.
    Batches(Vec<Batch>),
    /// The error was recovered internally; the scheduler should loop again
    /// without dispatching anything this cycle.
    Recovered,
    /// Unrecoverable; the runner should crash with this context.
    Fatal(RunnerError),
}

/// Drive one fetch cycle: call `fetch()`, and on error either recover in
/// place or report a fatal outcome. Does not sleep or loop itself; the
/// caller (the `Runner`'s lifecycle task) is responsible for the loop and
/// for respecting `running`.
pub async fn step(
    group: &Arc<dyn ConsumerGroup>,
    emitter: &Arc<dyn InstrumentationEmitter>,
    policy: &RetryPolicy,
    running: &Arc<AtomicBool>,
) -> StepOutcome {
    let started_at = Instant::now();

    // Only opaque (`Other`) fetch errors go through backoff here: the
    // rebalance/unknown-member/offset-out-of-range/not-implemented kinds
    // bail out of this retry immediately and are handled by `recover`
    // below, which re-joins or swallows rather than just re-fetching.
    let result = with_retry(policy, |_ctx| {
        let group = group.clone();
        async move {
            match group.fetch().await {
                Ok(batches) => Ok(batches),
                Err(err) => match err.kind {
                    KafkaErrorKind::Other => Err(RetryOutcome::Retriable(err)),
                    _ => Err(RetryOutcome::Bail(err)),
                },
            }
        }
    })
    .await;

    match result {
        Ok(batches) => {
            emitter
                .fetch(FetchEvent {
                    number_of_batches: batches.len(),
                    duration: started_at.elapsed(),
                })
                .await;
            StepOutcome::Batches(batches)
        }
        Err(err) => recover(group, emitter, policy, running, err).await,
    }
}

async fn recover(
    group: &Arc<dyn ConsumerGroup>,
    emitter: &Arc<dyn InstrumentationEmitter>,
    policy: &RetryPolicy,
    running: &Arc<AtomicBool>,
    err: GroupError,
) -> StepOutcome {
    match err.kind {
        KafkaErrorKind::RebalanceInProgress | KafkaErrorKind::NotCoordinatorForGroup => {
            common_metrics::inc("consumer_runner_rebalances_total", &[], 1);
            rejoin(group, emitter, policy, running).await
        }
        KafkaErrorKind::UnknownMemberId => {
            common_metrics::inc("consumer_runner_rebalances_total", &[], 1);
            group.clear_member_id();
            rejoin(group, emitter, policy, running).await
        }
        KafkaErrorKind::OffsetOutOfRange => StepOutcome::Recovered,
        KafkaErrorKind::NotImplemented => StepOutcome::Fatal(RunnerError::Group(err)),
        KafkaErrorKind::Other => StepOutcome::Fatal(RunnerError::Group(err)),
    }
}

async fn rejoin(
    group: &Arc<dyn ConsumerGroup>,
    emitter: &Arc<dyn InstrumentationEmitter>,
    policy: &RetryPolicy,
    running: &Arc<AtomicBool>,
) -> StepOutcome {
    if !running.load(Ordering::SeqCst) {
        return StepOutcome::Recovered;
    }
    match join::join(group, emitter, policy).await {
        Ok(()) => StepOutcome::Recovered,
        Err(err) => StepOutcome::Fatal(RunnerError::Group(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EndBatchProcessEvent, GroupJoinEvent, StartBatchProcessEvent};
    use crate::group::{OffsetsByTopicPartition, TopicPartition};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedGroup {
        fetch_results: Mutex<Vec<Result<Vec<Batch>, GroupError>>>,
        member_id_cleared: AtomicBool,
    }

    #[async_trait]
    impl ConsumerGroup for ScriptedGroup {
        fn group_id(&self) -> &str {
            "test-group"
        }
        fn member_id(&self) -> Option<String> {
            Some("member-1".to_string())
        }
        fn clear_member_id(&self) {
            self.member_id_cleared.store(true, Ordering::SeqCst);
        }
        fn leader_id(&self) -> Option<String> {
            Some("member-1".to_string())
        }
        fn is_leader(&self) -> bool {
            true
        }
        fn group_protocol(&self) -> Option<String> {
            Some("range".to_string())
        }
        fn member_assignment(&self) -> Vec<TopicPartition> {
            vec![]
        }
        async fn join(&self) -> Result<(), GroupError> {
            Ok(())
        }
        async fn sync(&self) -> Result<(), GroupError> {
            Ok(())
        }
        async fn leave(&self) -> Result<(), GroupError> {
            Ok(())
        }
        async fn fetch(&self) -> Result<Vec<Batch>, GroupError> {
            self.fetch_results.lock().unwrap().remove(0)
        }
        async fn heartbeat(&self, _interval: Duration) -> Result<(), GroupError> {
            Ok(())
        }
        async fn commit_offsets(
            &self,
            _offsets: Option<OffsetsByTopicPartition>,
        ) -> Result<(), GroupError> {
            Ok(())
        }
        async fn commit_offsets_if_necessary(&self) -> Result<(), GroupError> {
            Ok(())
        }
        async fn uncommitted_offsets(&self) -> OffsetsByTopicPartition {
            OffsetsByTopicPartition::new()
        }
        fn resolve_offset(&self, _tp: &TopicPartition, _offset: i64) {}
        fn has_seek_offset(&self, _tp: &TopicPartition) -> bool {
            false
        }
    }

    struct NoopEmitter;

    #[async_trait]
    impl InstrumentationEmitter for NoopEmitter {
        async fn group_join(&self, _event: GroupJoinEvent) {}
        async fn fetch(&self, _event: FetchEvent) {}
        async fn start_batch_process(&self, _event: StartBatchProcessEvent) {}
        async fn end_batch_process(&self, _event: EndBatchProcessEvent) {}
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_member_id_clears_and_rejoins() {
        let group = Arc::new(ScriptedGroup {
            fetch_results: Mutex::new(vec![Err(GroupError::new(
                KafkaErrorKind::UnknownMemberId,
                "unknown member",
            ))]),
            member_id_cleared: AtomicBool::new(false),
        });
        let group_dyn: Arc<dyn ConsumerGroup> = group.clone();
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let running = Arc::new(AtomicBool::new(true));

        let outcome = step(&group_dyn, &emitter, &RetryPolicy::default(), &running).await;
        assert!(matches!(outcome, StepOutcome::Recovered));
        assert!(group.member_id_cleared.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn offset_out_of_range_is_swallowed() {
        let group: Arc<dyn ConsumerGroup> = Arc::new(ScriptedGroup {
            fetch_results: Mutex::new(vec![Err(GroupError::new(
                KafkaErrorKind::OffsetOutOfRange,
                "out of range",
            ))]),
            member_id_cleared: AtomicBool::new(false),
        });
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let running = Arc::new(AtomicBool::new(true));

        let outcome = step(&group, &emitter, &RetryPolicy::default(), &running).await;
        assert!(matches!(outcome, StepOutcome::Recovered));
    }

    #[tokio::test(start_paused = true)]
    async fn not_implemented_is_fatal() {
        let group: Arc<dyn ConsumerGroup> = Arc::new(ScriptedGroup {
            fetch_results: Mutex::new(vec![Err(GroupError::new(
                KafkaErrorKind::NotImplemented,
                "unsupported",
            ))]),
            member_id_cleared: AtomicBool::new(false),
        });
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let running = Arc::new(AtomicBool::new(true));

        let outcome = step(&group, &emitter, &RetryPolicy::default(), &running).await;
        assert!(matches!(outcome, StepOutcome::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_runner_skips_rejoin_on_rebalance() {
        let group: Arc<dyn ConsumerGroup> = Arc::new(ScriptedGroup {
            fetch_results: Mutex::new(vec![Err(GroupError::new(
                KafkaErrorKind::RebalanceInProgress,
                "rebalance",
            ))]),
            member_id_cleared: AtomicBool::new(false),
        });
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let running = Arc::new(AtomicBool::new(false));

        let outcome = step(&group, &emitter, &RetryPolicy::default(), &running).await;
        assert!(matches!(outcome, StepOutcome::Recovered));
    }

    #[tokio::test(start_paused = true)]
    async fn opaque_errors_retry_with_backoff_before_crashing() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_coefficient: 1,
            initial_interval: Duration::from_millis(1),
            maximum_interval: None,
        };
        let group = Arc::new(ScriptedGroup {
            fetch_results: Mutex::new(vec![
                Err(GroupError::new(KafkaErrorKind::Other, "broker unreachable")),
                Err(GroupError::new(KafkaErrorKind::Other, "broker unreachable")),
                Err(GroupError::new(KafkaErrorKind::Other, "broker unreachable")),
            ]),
            member_id_cleared: AtomicBool::new(false),
        });
        let group_dyn: Arc<dyn ConsumerGroup> = group.clone();
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let running = Arc::new(AtomicBool::new(true));

        let outcome = step(&group_dyn, &emitter, &policy, &running).await;
        assert!(matches!(outcome, StepOutcome::Fatal(_)));
        assert!(group.fetch_results.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn opaque_error_recovers_if_a_retry_succeeds() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_coefficient: 1,
            initial_interval: Duration::from_millis(1),
            maximum_interval: None,
        };
        let group: Arc<dyn ConsumerGroup> = Arc::new(ScriptedGroup {
            fetch_results: Mutex::new(vec![
                Err(GroupError::new(KafkaErrorKind::Other, "transient")),
                Ok(vec![]),
            ]),
            member_id_cleared: AtomicBool::new(false),
        });
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let running = Arc::new(AtomicBool::new(true));

        let outcome = step(&group, &emitter, &policy, &running).await;
        assert!(matches!(outcome, StepOutcome::Batches(b) if b.is_empty()));
    }
}
