//! Join/Sync Driver: establishes and re-establishes group membership.
//!
//! `join()` wraps the collaborator's `join`/`sync` pair in the shared retry
//! driver. Per §4.2, only the two coordinator-rebalance signals are
//! retriable here; everything else — including `UNKNOWN_MEMBER_ID` and
//! opaque errors the scheduler would otherwise retry from a `fetch()` — is
//! bailed immediately, since join/sync failing for any other reason isn't
//! something a fixed backoff can recover from.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{GroupError, KafkaErrorKind};
use crate::events::{GroupJoinEvent, InstrumentationEmitter};
use crate::group::ConsumerGroup;
use crate::retry::{with_retry, RetryOutcome, RetryPolicy};

/// Join the group (and sync, completing the rebalance), retrying transient
/// coordinator errors and emitting a `GroupJoinEvent` once membership is
/// established.
pub async fn join(
    group: &Arc<dyn ConsumerGroup>,
    emitter: &Arc<dyn InstrumentationEmitter>,
    policy: &RetryPolicy,
) -> Result<(), GroupError> {
    let started_at = Instant::now();

    with_retry(policy, |_ctx| {
        let group = group.clone();
        async move {
            if let Err(err) = group.join().await {
                return Err(classify(err));
            }
            if let Err(err) = group.sync().await {
                return Err(classify(err));
            }
            Ok(())
        }
    })
    .await?;

    emitter
        .group_join(GroupJoinEvent {
            group_id: group.group_id().to_string(),
            member_id: group.member_id().unwrap_or_default(),
            leader_id: group.leader_id().unwrap_or_default(),
            is_leader: group.is_leader(),
            member_assignment: group.member_assignment(),
            group_protocol: group.group_protocol(),
            duration: started_at.elapsed(),
        })
        .await;

    Ok(())
}

/// Only `REBALANCE_IN_PROGRESS`/`NOT_COORDINATOR_FOR_GROUP` are retriable
/// here: recovery needs a full find-coordinator-plus-join cycle, which is
/// exactly what retrying `join()`/`sync()` under backoff gives us. Every
/// other error, `UNKNOWN_MEMBER_ID` included, bails immediately; clearing
/// the member id for an `UNKNOWN_MEMBER_ID` is the scheduler's job
/// (`scheduler::recover`) when it decides to re-join after a `fetch()`
/// failure, not this driver's.
fn classify(err: GroupError) -> RetryOutcome<GroupError> {
    match err.kind {
        KafkaErrorKind::RebalanceInProgress | KafkaErrorKind::NotCoordinatorForGroup => {
            RetryOutcome::Retriable(err)
        }
        _ => RetryOutcome::Bail(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EndBatchProcessEvent, FetchEvent, StartBatchProcessEvent};
    use crate::group::{Batch, OffsetsByTopicPartition, TopicPartition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FlakyGroup {
        join_failures_remaining: AtomicU32,
        joined: Mutex<bool>,
    }

    #[async_trait]
    impl ConsumerGroup for FlakyGroup {
        fn group_id(&self) -> &str {
            "test-group"
        }
        fn member_id(&self) -> Option<String> {
            Some("member-1".to_string())
        }
        fn clear_member_id(&self) {}
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
            vec![TopicPartition::new("events", 0)]
        }
        async fn join(&self) -> Result<(), GroupError> {
            if self.join_failures_remaining.load(Ordering::SeqCst) > 0 {
                self.join_failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(GroupError::new(
                    KafkaErrorKind::RebalanceInProgress,
                    "rebalance in progress",
                ));
            }
            *self.joined.lock().unwrap() = true;
            Ok(())
        }
        async fn sync(&self) -> Result<(), GroupError> {
            Ok(())
        }
        async fn leave(&self) -> Result<(), GroupError> {
            Ok(())
        }
        async fn fetch(&self) -> Result<Vec<Batch>, GroupError> {
            Ok(vec![])
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
    async fn retries_rebalance_in_progress_until_join_succeeds() {
        let group: Arc<dyn ConsumerGroup> = Arc::new(FlakyGroup {
            join_failures_remaining: AtomicU32::new(2),
            joined: Mutex::new(false),
        });
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_coefficient: 1,
            initial_interval: Duration::from_millis(1),
            maximum_interval: None,
        };

        join(&group, &emitter, &policy).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn not_implemented_bails_without_retrying() {
        struct BailingGroup;
        #[async_trait]
        impl ConsumerGroup for BailingGroup {
            fn group_id(&self) -> &str {
                "test-group"
            }
            fn member_id(&self) -> Option<String> {
                None
            }
            fn clear_member_id(&self) {}
            fn leader_id(&self) -> Option<String> {
                None
            }
            fn is_leader(&self) -> bool {
                false
            }
            fn group_protocol(&self) -> Option<String> {
                None
            }
            fn member_assignment(&self) -> Vec<TopicPartition> {
                vec![]
            }
            async fn join(&self) -> Result<(), GroupError> {
                Err(GroupError::new(
                    KafkaErrorKind::NotImplemented,
                    "unsupported protocol",
                ))
            }
            async fn sync(&self) -> Result<(), GroupError> {
                Ok(())
            }
            async fn leave(&self) -> Result<(), GroupError> {
                Ok(())
            }
            async fn fetch(&self) -> Result<Vec<Batch>, GroupError> {
                Ok(vec![])
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

        let group: Arc<dyn ConsumerGroup> = Arc::new(BailingGroup);
        let emitter: Arc<dyn InstrumentationEmitter> = Arc::new(NoopEmitter);
        let result = join(&group, &emitter, &RetryPolicy::default()).await;
        assert_eq!(result.unwrap_err().kind, KafkaErrorKind::NotImplemented);
    }
}
