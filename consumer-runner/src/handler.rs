//! User-supplied handlers and the batch control surface.
//!
//! The source duck-types `eachMessage` vs `eachBatch`; here that's a tagged
//! variant chosen once at `Runner` construction, and the fetch cycle
//! branches on the tag instead of probing for which callback was set.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::group::{Batch, ConsumerGroup, Message, OffsetsByTopicPartition, TopicPartition};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Arguments passed to the message handler for a single record.
pub struct MessageContext {
    pub topic: String,
    pub partition: i32,
    pub message: Message,
}

pub type MessageHandlerFn =
    dyn Fn(MessageContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

pub type BatchHandlerFn = dyn Fn(BatchControl) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Exactly one of these is configured per `Runner`.
#[derive(Clone)]
pub enum Handler {
    Message(Arc<MessageHandlerFn>),
    Batch(Arc<BatchHandlerFn>),
}

impl Handler {
    pub fn message<F, Fut>(f: F) -> Self
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Handler::Message(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn batch<F, Fut>(f: F) -> Self
    where
        F: Fn(BatchControl) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Handler::Batch(Arc::new(move |ctl| Box::pin(f(ctl))))
    }
}

/// The control surface passed to the batch handler. Immutable per
/// invocation; captures the current batch context. On a threaded target this
/// is a small `Send + Sync` struct rather than a record of closures, but the
/// six operations are the same ones the spec names.
#[derive(Clone)]
pub struct BatchControl {
    group: Arc<dyn ConsumerGroup>,
    tp: TopicPartition,
    heartbeat_interval: Duration,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl BatchControl {
    pub(crate) fn new(
        group: Arc<dyn ConsumerGroup>,
        batch: &Batch,
        heartbeat_interval: Duration,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            group,
            tp: batch.topic_partition(),
            heartbeat_interval,
            running,
        }
    }

    /// Mark `offset` as ready to commit for this batch's (topic, partition).
    pub fn resolve_offset(&self, offset: i64) {
        self.group.resolve_offset(&self.tp, offset);
    }

    /// Send a heartbeat, honoring `heartbeatInterval` throttling.
    pub async fn heartbeat(&self) -> Result<(), crate::error::GroupError> {
        self.group.heartbeat(self.heartbeat_interval).await
    }

    /// Commit `offsets` if given, otherwise commit per the auto-commit
    /// thresholds.
    pub async fn commit_offsets_if_necessary(
        &self,
        offsets: Option<OffsetsByTopicPartition>,
    ) -> Result<(), crate::error::GroupError> {
        match offsets {
            Some(offsets) => self.group.commit_offsets(Some(offsets)).await,
            None => self.group.commit_offsets_if_necessary().await,
        }
    }

    /// Snapshot of resolved-but-not-yet-committed offsets.
    pub async fn uncommitted_offsets(&self) -> OffsetsByTopicPartition {
        self.group.uncommitted_offsets().await
    }

    /// Current `running` flag, as observed by handlers.
    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// True iff a seek has invalidated this batch's partition since it was
    /// fetched.
    pub fn is_stale(&self) -> bool {
        self.group.has_seek_offset(&self.tp)
    }
}
