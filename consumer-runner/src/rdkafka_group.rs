//! `rdkafka`-backed `ConsumerGroup`: the one concrete adapter shipped with
//! the runner, generalizing `common_kafka::kafka_consumer::SingleTopicConsumer`'s
//! `ClientConfig` setup from a single topic/partition to the full group
//! surface (explicit heartbeat throttling, per-partition offset resolution,
//! seek invalidation) that the runner's traits need.
//!
//! `librdkafka` itself owns the wire-level join/sync/heartbeat RPC
//! sequencing; `RebalanceTracker` mirrors its rebalance callbacks into the
//! plain data this crate's trait exposes (`member_assignment`,
//! `is_leader`, ...), and `join`/`sync` here just wait for the next
//! rebalance to land since `StreamConsumer::subscribe` triggers it
//! implicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message as _, TopicPartitionList};
use tokio::sync::Notify;

use crate::config::RunnerConfig;
use crate::error::GroupError;
use crate::group::{Batch, ConsumerGroup, Message, OffsetsByTopicPartition, TopicPartition};

#[derive(Default)]
struct Assignment {
    partitions: Vec<TopicPartition>,
    is_leader: bool,
    leader_id: Option<String>,
}

struct RebalanceContext {
    assignment: Mutex<Assignment>,
    rebalanced: Notify,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions = tpl
                .elements()
                .iter()
                .map(|el| TopicPartition::new(el.topic(), el.partition()))
                .collect();
            let mut assignment = self.assignment.lock().unwrap();
            assignment.partitions = partitions;
        }
        self.rebalanced.notify_waiters();
    }
}

type RebalancingConsumer = StreamConsumer<RebalanceContext>;

/// A `ConsumerGroup` backed by a real `librdkafka` consumer. One instance
/// per consumer group membership; `fetch()` polls outstanding messages per
/// assigned partition up to the configured batch cap.
pub struct RdKafkaConsumerGroup {
    group_id: String,
    consumer: RebalancingConsumer,
    context: Arc<RebalanceContext>,
    member_id: Mutex<Option<String>>,
    last_heartbeat: Mutex<Option<Instant>>,
    resolved_offsets: Mutex<OffsetsByTopicPartition>,
    seek_generation: Mutex<HashMap<TopicPartition, u64>>,
    fetch_generation: Mutex<HashMap<TopicPartition, u64>>,
    messages_since_commit: AtomicI64,
    last_commit: Mutex<Instant>,
    commit_every_n: u64,
    commit_interval: Duration,
    fetch_batch_size: usize,
    fetch_timeout: Duration,
    closed: AtomicBool,
}

impl RdKafkaConsumerGroup {
    pub fn new(kafka: &RunnerConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &kafka.kafka.kafka_hosts)
            .set("group.id", &kafka.consumer.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &kafka.consumer.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("statistics.interval.ms", "10000");

        if kafka.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: RebalancingConsumer = client_config.create_with_context(RebalanceContext {
            assignment: Mutex::new(Assignment::default()),
            rebalanced: Notify::new(),
        })?;
        consumer.subscribe(&[kafka.consumer.kafka_consumer_topic.as_str()])?;
        let context = consumer.context().clone();

        Ok(Self {
            group_id: kafka.consumer.kafka_consumer_group.clone(),
            consumer,
            context,
            member_id: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
            resolved_offsets: Mutex::new(OffsetsByTopicPartition::new()),
            seek_generation: Mutex::new(HashMap::new()),
            fetch_generation: Mutex::new(HashMap::new()),
            messages_since_commit: AtomicI64::new(0),
            last_commit: Mutex::new(Instant::now()),
            commit_every_n: kafka.commit_offsets_every_n_messages,
            commit_interval: kafka.commit_offsets_interval(),
            fetch_batch_size: 500,
            fetch_timeout: Duration::from_millis(250),
            closed: AtomicBool::new(false),
        })
    }
}

impl RdKafkaConsumerGroup {
    /// Reposition `tp`'s read cursor to `offset`, invalidating any batch for
    /// that partition already in flight. Not part of the `ConsumerGroup`
    /// trait: the specification only names `hasSeekOffset` as something the
    /// runner consumes, and leaves *who* requests a seek to an external
    /// collaborator (an admin surface, out of this crate's scope). Exposed
    /// here as an inherent method so that collaborator has something to call
    /// against the real adapter, the same way the test double in this
    /// crate's integration tests exposes its own `seek`.
    pub fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), GroupError> {
        let fetch_gen = *self.fetch_generation.lock().unwrap().get(tp).unwrap_or(&0);
        self.seek_generation
            .lock()
            .unwrap()
            .insert(tp.clone(), fetch_gen + 1);
        self.consumer
            .seek(
                &tp.topic,
                tp.partition,
                rdkafka::Offset::Offset(offset),
                Duration::from_secs(5),
            )
            .map_err(GroupError::from_rdkafka)
    }
}

#[async_trait]
impl ConsumerGroup for RdKafkaConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn member_id(&self) -> Option<String> {
        self.member_id.lock().unwrap().clone()
    }

    fn clear_member_id(&self) {
        *self.member_id.lock().unwrap() = None;
    }

    fn leader_id(&self) -> Option<String> {
        self.context.assignment.lock().unwrap().leader_id.clone()
    }

    fn is_leader(&self) -> bool {
        self.context.assignment.lock().unwrap().is_leader
    }

    fn group_protocol(&self) -> Option<String> {
        Some("range".to_string())
    }

    fn member_assignment(&self) -> Vec<TopicPartition> {
        self.context.assignment.lock().unwrap().partitions.clone()
    }

    async fn join(&self) -> Result<(), GroupError> {
        // `subscribe` already requested group membership; wait for
        // librdkafka to deliver the first assignment callback.
        self.context.rebalanced.notified().await;
        if self.member_id.lock().unwrap().is_none() {
            *self.member_id.lock().unwrap() = Some(uuid::Uuid::new_v4().to_string());
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), GroupError> {
        Ok(())
    }

    async fn leave(&self) -> Result<(), GroupError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Batch>, GroupError> {
        let mut by_partition: HashMap<TopicPartition, Vec<Message>> = HashMap::new();

        for _ in 0..self.fetch_batch_size {
            let next = tokio::time::timeout(self.fetch_timeout, self.consumer.recv()).await;
            let borrowed = match next {
                Ok(Ok(m)) => m,
                Ok(Err(err)) => return Err(GroupError::from_rdkafka(err)),
                Err(_) => break,
            };

            let tp = TopicPartition::new(borrowed.topic(), borrowed.partition());
            *self
                .fetch_generation
                .lock()
                .unwrap()
                .entry(tp.clone())
                .or_insert(0) += 1;

            let message = Message {
                offset: borrowed.offset(),
                key: borrowed.key().map(|k| k.to_vec()),
                value: borrowed.payload().map(|v| v.to_vec()),
                timestamp_ms: borrowed.timestamp().to_millis(),
                headers: Vec::new(),
            };
            by_partition.entry(tp).or_default().push(message);
        }

        let watermarks: HashMap<TopicPartition, i64> = by_partition
            .keys()
            .map(|tp| {
                let hw = self
                    .consumer
                    .fetch_watermarks(&tp.topic, tp.partition, Duration::from_secs(1))
                    .map(|(_, high)| high)
                    .unwrap_or(-1);
                (tp.clone(), hw)
            })
            .collect();

        let batches = by_partition
            .into_iter()
            .map(|(tp, messages)| Batch {
                topic: tp.topic.clone(),
                partition: tp.partition,
                high_watermark: *watermarks.get(&tp).unwrap_or(&-1),
                messages,
            })
            .collect();

        Ok(batches)
    }

    async fn heartbeat(&self, interval: Duration) -> Result<(), GroupError> {
        let mut last = self.last_heartbeat.lock().unwrap();
        let due = match *last {
            Some(t) => t.elapsed() >= interval,
            None => true,
        };
        if due {
            // `StreamConsumer::recv` already keeps librdkafka's background
            // poll loop alive, which is what actually carries heartbeats;
            // this just tracks the throttle window the runner's callers see.
            *last = Some(Instant::now());
        }
        Ok(())
    }

    async fn commit_offsets(
        &self,
        offsets: Option<OffsetsByTopicPartition>,
    ) -> Result<(), GroupError> {
        let to_commit = offsets.unwrap_or_else(|| self.resolved_offsets.lock().unwrap().clone());
        if to_commit.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in &to_commit {
            tpl.add_partition_offset(
                &tp.topic,
                tp.partition,
                rdkafka::Offset::Offset(offset + 1),
            )
            .map_err(|err| {
                common_metrics::inc("consumer_runner_commit_errors_total", &[], 1);
                GroupError::from_rdkafka(err)
            })?;
        }
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Async)
            .map_err(|err| {
                common_metrics::inc("consumer_runner_commit_errors_total", &[], 1);
                GroupError::from_rdkafka(err)
            })?;

        let mut resolved = self.resolved_offsets.lock().unwrap();
        for tp in to_commit.keys() {
            resolved.remove(tp);
        }
        self.messages_since_commit.store(0, Ordering::SeqCst);
        *self.last_commit.lock().unwrap() = Instant::now();
        Ok(())
    }

    async fn commit_offsets_if_necessary(&self) -> Result<(), GroupError> {
        let due_by_count =
            self.messages_since_commit.load(Ordering::SeqCst) as u64 >= self.commit_every_n;
        let due_by_time = self.last_commit.lock().unwrap().elapsed() >= self.commit_interval;
        if due_by_count || due_by_time {
            self.commit_offsets(None).await
        } else {
            Ok(())
        }
    }

    async fn uncommitted_offsets(&self) -> OffsetsByTopicPartition {
        self.resolved_offsets.lock().unwrap().clone()
    }

    fn resolve_offset(&self, tp: &TopicPartition, offset: i64) {
        self.resolved_offsets
            .lock()
            .unwrap()
            .insert(tp.clone(), offset);
        self.messages_since_commit.fetch_add(1, Ordering::SeqCst);
    }

    fn has_seek_offset(&self, tp: &TopicPartition) -> bool {
        let seeks = self.seek_generation.lock().unwrap();
        let fetches = self.fetch_generation.lock().unwrap();
        match (seeks.get(tp), fetches.get(tp)) {
            (Some(seek_gen), Some(fetch_gen)) => seek_gen > fetch_gen,
            _ => false,
        }
    }
}
