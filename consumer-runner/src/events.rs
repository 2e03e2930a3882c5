//! Instrumentation events emitted across the join/sync driver and the batch
//! dispatcher. The shipped implementation emits `tracing` events at the
//! fields named below and mirrors them into `metrics` counters/histograms
//! via `common_metrics`, the same way `ingestion-consumer`'s consumer loop
//! logs structured fields and increments `metrics::counter!` side by side.

use std::time::Duration;

use async_trait::async_trait;

use crate::group::TopicPartition;

#[derive(Debug, Clone)]
pub struct GroupJoinEvent {
    pub group_id: String,
    pub member_id: String,
    pub leader_id: String,
    pub is_leader: bool,
    pub member_assignment: Vec<TopicPartition>,
    pub group_protocol: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub number_of_batches: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct StartBatchProcessEvent {
    pub topic: String,
    pub partition: i32,
    pub first_offset: Option<i64>,
    pub last_offset: Option<i64>,
    pub offset_lag: i64,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct EndBatchProcessEvent {
    pub topic: String,
    pub partition: i32,
    pub duration: Duration,
}

/// Consumed by the runner; the wire format and transport of instrumentation
/// is entirely this trait's implementer's concern.
#[async_trait]
pub trait InstrumentationEmitter: Send + Sync {
    async fn group_join(&self, event: GroupJoinEvent);
    async fn fetch(&self, event: FetchEvent);
    async fn start_batch_process(&self, event: StartBatchProcessEvent);
    async fn end_batch_process(&self, event: EndBatchProcessEvent);
}

/// Default implementation: structured `tracing` events plus `metrics`
/// counters/histograms, matching the rest of this workspace's long-running
/// consumer loops.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

#[async_trait]
impl InstrumentationEmitter for TracingEmitter {
    async fn group_join(&self, event: GroupJoinEvent) {
        tracing::info!(
            group_id = event.group_id,
            member_id = event.member_id,
            leader_id = event.leader_id,
            is_leader = event.is_leader,
            assigned_partitions = event.member_assignment.len(),
            group_protocol = event.group_protocol.as_deref().unwrap_or("unknown"),
            duration_ms = event.duration.as_millis() as u64,
            "consumer group joined"
        );
        common_metrics::inc("consumer_runner_group_joins_total", &[], 1);
    }

    async fn fetch(&self, event: FetchEvent) {
        tracing::debug!(
            number_of_batches = event.number_of_batches,
            duration_ms = event.duration.as_millis() as u64,
            "fetch cycle completed"
        );
        common_metrics::histogram(
            "consumer_runner_fetch_cycle_duration_ms",
            &[],
            event.duration.as_millis() as f64,
        );
    }

    async fn start_batch_process(&self, event: StartBatchProcessEvent) {
        tracing::debug!(
            topic = event.topic,
            partition = event.partition,
            first_offset = event.first_offset,
            last_offset = event.last_offset,
            offset_lag = event.offset_lag,
            batch_size = event.batch_size,
            "starting batch"
        );
    }

    async fn end_batch_process(&self, event: EndBatchProcessEvent) {
        tracing::debug!(
            topic = event.topic,
            partition = event.partition,
            duration_ms = event.duration.as_millis() as u64,
            "finished batch"
        );
        let labels = [
            ("topic".to_string(), event.topic.clone()),
            ("partition".to_string(), event.partition.to_string()),
        ];
        common_metrics::inc("consumer_runner_batches_processed_total", &labels, 1);
    }
}
