//! Batch Dispatcher: turns one fetch cycle's batches into handler
//! invocations, bounded by the concurrency limiter, honoring
//! `eachBatchAutoResolve`/auto-commit, and surfacing handler failures as
//! `RunnerError::Handler`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{GroupError, RunnerError};
use crate::events::{EndBatchProcessEvent, InstrumentationEmitter, StartBatchProcessEvent};
use crate::group::{Batch, ConsumerGroup};
use crate::handler::{BatchControl, Handler, MessageContext};
use crate::limiter::ConcurrencyLimiter;

/// Dispatch every batch from one fetch cycle, one task per (topic,
/// partition), bounded by `limiter`. A batch whose partition is stale by the
/// time its task runs (a seek landed after fetch but before dispatch) is
/// skipped rather than processed against invalidated offsets.
pub async fn dispatch(
    batches: Vec<Batch>,
    group: &Arc<dyn ConsumerGroup>,
    handler: &Handler,
    emitter: &Arc<dyn InstrumentationEmitter>,
    limiter: &ConcurrencyLimiter,
    heartbeat_interval: std::time::Duration,
    auto_commit: bool,
    each_batch_auto_resolve: bool,
    running: &Arc<AtomicBool>,
) -> Result<(), RunnerError> {
    let mut handles = Vec::with_capacity(batches.len());

    for batch in batches {
        let group = group.clone();
        let handler = handler.clone();
        let emitter = emitter.clone();
        let running = running.clone();

        handles.push(limiter.submit(async move {
            process_batch(
                batch,
                group,
                handler,
                emitter,
                heartbeat_interval,
                auto_commit,
                each_batch_auto_resolve,
                running,
            )
            .await
        }));
    }

    for handle in handles {
        handle.await.map_err(RunnerError::Join)??;
    }

    // Cycle-level trailing steps from the fetch() contract: commit all
    // resolved offsets (unconditionally, not threshold-gated, hence
    // `commit_offsets(None)` rather than `commit_offsets_if_necessary`) if
    // auto-commit is on, then a trailing heartbeat regardless.
    auto_commit_offsets(group, auto_commit).await?;
    group.heartbeat(heartbeat_interval).await?;
    common_metrics::inc("consumer_runner_heartbeats_total", &[], 1);

    Ok(())
}

/// `autoCommitOffsets()`: commit every resolved offset if `auto_commit` is
/// on, otherwise a no-op. Distinct from `commit_offsets_if_necessary`, which
/// only commits once the interval/count thresholds are met.
async fn auto_commit_offsets(
    group: &Arc<dyn ConsumerGroup>,
    auto_commit: bool,
) -> Result<(), RunnerError> {
    if auto_commit {
        group.commit_offsets(None).await?;
    }
    Ok(())
}

/// Log unrecognized handler failures at error level with their full cause
/// chain. A handler error that wraps a recognized `GroupError` (the user
/// re-threw a Kafka-domain error verbatim) is assumed already logged by
/// whatever raised it, so it's skipped here per the component design's
/// "if it is not a recognized Kafka-domain error" qualifier.
fn log_unrecognized_handler_error(err: &anyhow::Error, topic: &str, partition: i32, offset: i64) {
    if err.downcast_ref::<GroupError>().is_some() {
        return;
    }
    tracing::error!(
        topic,
        partition,
        offset,
        error = ?err,
        "handler failed while processing batch"
    );
}

async fn process_batch(
    batch: Batch,
    group: Arc<dyn ConsumerGroup>,
    handler: Handler,
    emitter: Arc<dyn InstrumentationEmitter>,
    heartbeat_interval: std::time::Duration,
    auto_commit: bool,
    each_batch_auto_resolve: bool,
    running: Arc<AtomicBool>,
) -> Result<(), RunnerError> {
    let tp = batch.topic_partition();
    if group.has_seek_offset(&tp) {
        return Ok(());
    }
    if batch.is_empty() {
        return Ok(());
    }

    let started_at = Instant::now();
    emitter
        .start_batch_process(StartBatchProcessEvent {
            topic: batch.topic.clone(),
            partition: batch.partition,
            first_offset: batch.first_offset(),
            last_offset: batch.last_offset(),
            offset_lag: batch.offset_lag(),
            batch_size: batch.messages.len(),
        })
        .await;

    match &handler {
        Handler::Message(handle_message) => {
            for message in &batch.messages {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if group.has_seek_offset(&tp) {
                    break;
                }
                let ctx = MessageContext {
                    topic: batch.topic.clone(),
                    partition: batch.partition,
                    message: message.clone(),
                };
                let offset = message.offset;
                if let Err(err) = handle_message(ctx).await {
                    log_unrecognized_handler_error(&err, &batch.topic, batch.partition, offset);
                    // Commit progress resolved up to, but not including, the
                    // failing message before the error propagates.
                    group.commit_offsets(None).await?;
                    return Err(RunnerError::Handler(err));
                }
                group.resolve_offset(&tp, offset);
                common_metrics::inc("consumer_runner_messages_processed_total", &[], 1);
                group.heartbeat(heartbeat_interval).await?;
                common_metrics::inc("consumer_runner_heartbeats_total", &[], 1);
                if auto_commit {
                    group.commit_offsets_if_necessary().await?;
                }
            }
        }
        Handler::Batch(handle_batch) => {
            let control = BatchControl::new(group.clone(), &batch, heartbeat_interval, running);
            if let Err(err) = handle_batch(control).await {
                log_unrecognized_handler_error(
                    &err,
                    &batch.topic,
                    batch.partition,
                    batch.last_offset().unwrap_or(-1),
                );
                auto_commit_offsets(&group, auto_commit).await?;
                return Err(RunnerError::Handler(err));
            }
            if each_batch_auto_resolve && !group.has_seek_offset(&tp) {
                if let Some(last) = batch.last_offset() {
                    group.resolve_offset(&tp, last);
                }
            }
        }
    }

    emitter
        .end_batch_process(EndBatchProcessEvent {
            topic: batch.topic.clone(),
            partition: batch.partition,
            duration: started_at.elapsed(),
        })
        .await;

    Ok(())
}
