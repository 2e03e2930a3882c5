//! The `ConsumerGroup` collaborator: join/sync/heartbeat/fetch/commit RPC
//! sequencing against a Kafka-protocol group coordinator.
//!
//! This module only defines the *interface* the runner consumes (per the
//! scope note in the purpose section — the wire protocol, broker connection
//! pool, and RPC sequencing itself are external collaborators). See
//! `rdkafka_group` for the one concrete, `rdkafka`-backed implementation
//! shipped alongside the runner.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GroupError;

/// Identifies a single partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// A single Kafka record. Read-only; its lifetime is bounded by its batch.
#[derive(Debug, Clone)]
pub struct Message {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp_ms: Option<i64>,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// One fetch result for a single (topic, partition): an ordered message
/// sequence plus the metadata needed to derive offsets and lag.
#[derive(Debug, Clone)]
pub struct Batch {
    pub topic: String,
    pub partition: i32,
    pub high_watermark: i64,
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }

    /// Number of messages beyond the last one in this batch that the
    /// partition's high watermark reports as available.
    pub fn offset_lag(&self) -> i64 {
        match self.last_offset() {
            Some(last) => (self.high_watermark - 1 - last).max(0),
            None => 0,
        }
    }
}

pub type OffsetsByTopicPartition = HashMap<TopicPartition, i64>;

/// The group-membership and offset RPC sequencing the runner drives. Shared
/// by the scheduler and the batch dispatcher; implementations must serialize
/// concurrent commit/heartbeat calls internally since partition tasks may
/// call them from multiple concurrently-running batch tasks.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    fn group_id(&self) -> &str;

    /// Current member id, if the group has been joined. `None` after a
    /// `clear_member_id` following `UNKNOWN_MEMBER_ID`, forcing
    /// re-identification on the next join.
    fn member_id(&self) -> Option<String>;

    /// Clear the member id so the next `join()` re-identifies with the
    /// coordinator from scratch.
    fn clear_member_id(&self);

    fn leader_id(&self) -> Option<String>;

    fn is_leader(&self) -> bool;

    fn group_protocol(&self) -> Option<String>;

    /// Partitions currently assigned to this member.
    fn member_assignment(&self) -> Vec<TopicPartition>;

    async fn join(&self) -> Result<(), GroupError>;

    async fn sync(&self) -> Result<(), GroupError>;

    async fn leave(&self) -> Result<(), GroupError>;

    async fn fetch(&self) -> Result<Vec<Batch>, GroupError>;

    /// Self-throttling: a no-op if called again before `interval` has
    /// elapsed since the last successful heartbeat.
    async fn heartbeat(&self, interval: Duration) -> Result<(), GroupError>;

    /// Commit explicit offsets, or all resolved-but-uncommitted offsets if
    /// `offsets` is `None`.
    async fn commit_offsets(
        &self,
        offsets: Option<OffsetsByTopicPartition>,
    ) -> Result<(), GroupError>;

    /// Commit according to the auto-commit interval/count thresholds; a
    /// no-op if none are due.
    async fn commit_offsets_if_necessary(&self) -> Result<(), GroupError>;

    /// Snapshot of resolved-but-not-yet-committed offsets.
    async fn uncommitted_offsets(&self) -> OffsetsByTopicPartition;

    /// Mark `offset` as ready to commit for `tp`. Resolved offsets advance
    /// monotonically within a batch.
    fn resolve_offset(&self, tp: &TopicPartition, offset: i64);

    /// True iff an external seek has repositioned `tp`'s cursor since it was
    /// last fetched, invalidating any in-flight batch for that partition.
    fn has_seek_offset(&self, tp: &TopicPartition) -> bool;
}
