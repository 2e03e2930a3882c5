//! Lifecycle Controller: owns `running`/`consuming`, drives join then the
//! fetch/dispatch loop, and invokes the crash handler exactly once on a
//! fatal outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RunnerConfig;
use crate::dispatcher;
use crate::error::{CrashContext, RunnerError};
use crate::events::{InstrumentationEmitter, TracingEmitter};
use crate::group::ConsumerGroup;
use crate::handler::Handler;
use crate::join;
use crate::limiter::ConcurrencyLimiter;
use crate::scheduler::{self, StepOutcome};

/// Invoked exactly once, with the error and context that caused the runner
/// to stop unexpectedly. Mirrors `ingestion-consumer`'s crash-to-`lifecycle`
/// wiring: a binary typically calls `Handle::signal_failure` from here.
pub type CrashHandler = Arc<dyn Fn(&RunnerError, CrashContext) + Send + Sync>;

/// Drives one consumer group's join/sync -> fetch -> dispatch loop.
///
/// `running` gates whether the loop keeps fetching; `consuming` reports
/// whether a fetch/dispatch cycle is currently in flight, so `stop()` can
/// wait for in-progress work to drain before returning (unless
/// `test_mode` is set, in which case `stop()` only waits on `running`).
pub struct Runner {
    group: Arc<dyn ConsumerGroup>,
    handler: Handler,
    emitter: Arc<dyn InstrumentationEmitter>,
    config: RunnerConfig,
    limiter: ConcurrencyLimiter,
    crash_handler: Option<CrashHandler>,
    health: Option<lifecycle::Handle>,
    running: Arc<AtomicBool>,
    consuming: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(group: Arc<dyn ConsumerGroup>, handler: Handler, config: RunnerConfig) -> Self {
        let limiter = ConcurrencyLimiter::new(config.partitions_consumed_concurrently);
        Self {
            group,
            handler,
            emitter: Arc::new(TracingEmitter),
            config,
            limiter,
            crash_handler: None,
            health: None,
            running: Arc::new(AtomicBool::new(false)),
            consuming: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn InstrumentationEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_crash_handler(mut self, handler: CrashHandler) -> Self {
        self.crash_handler = Some(handler);
        self
    }

    /// Register this runner with a `lifecycle::Manager`-issued handle, so a
    /// crash reports through the binary's shared shutdown path in addition
    /// to (or instead of) a dedicated `crash_handler`, and so the fetch loop
    /// reports liveness on every cycle.
    pub fn with_health_handle(mut self, handle: lifecycle::Handle) -> Self {
        self.health = Some(handle);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Join the group and enter the fetch/dispatch loop. Returns once the
    /// loop exits, either because `stop()` was called or because a fatal
    /// error occurred (in which case the crash handler has already run).
    /// Idempotent: a second call while already running returns immediately
    /// without touching group state, so a caller retrying `start()` can't
    /// spin up a second concurrent fetch loop against the same group.
    pub async fn start(&self) -> Result<(), RunnerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let policy = self.config.retry_policy();
        if let Err(err) = join::join(&self.group, &self.emitter, &policy).await {
            self.running.store(false, Ordering::SeqCst);
            let crash_err = RunnerError::Group(err);
            self.crash(
                &crash_err,
                CrashContext {
                    stage: "join",
                    retries_attempted: policy.max_retries,
                },
            );
            return Err(crash_err);
        }

        while self.running.load(Ordering::SeqCst) {
            self.consuming.store(true, Ordering::SeqCst);
            let outcome = scheduler::step(&self.group, &self.emitter, &policy, &self.running).await;

            let result = match outcome {
                StepOutcome::Batches(batches) => {
                    dispatcher::dispatch(
                        batches,
                        &self.group,
                        &self.handler,
                        &self.emitter,
                        &self.limiter,
                        self.config.heartbeat_interval(),
                        self.config.auto_commit,
                        self.config.each_batch_auto_resolve,
                        &self.running,
                    )
                    .await
                }
                StepOutcome::Recovered => Ok(()),
                StepOutcome::Fatal(err) => Err(err),
            };

            self.consuming.store(false, Ordering::SeqCst);
            if let Some(health) = &self.health {
                health.report_healthy();
            }

            if let Err(err) = result {
                self.running.store(false, Ordering::SeqCst);
                let kind = err.kafka_kind();
                self.crash(
                    &err,
                    CrashContext {
                        stage: "fetch_dispatch",
                        retries_attempted: if kind.is_rebalance_signal() {
                            policy.max_retries
                        } else {
                            0
                        },
                    },
                );
                return Err(err);
            }
        }

        let _ = self.group.leave().await;
        Ok(())
    }

    /// Signal the loop to stop after its current cycle and wait for it to
    /// drain. In `test_mode`, returns as soon as `running` is cleared
    /// rather than polling `consuming`, since tests typically never drive a
    /// real fetch loop to completion.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.config.test_mode {
            return;
        }
        while self.consuming.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn crash(&self, err: &RunnerError, ctx: CrashContext) {
        if let Some(health) = &self.health {
            health.signal_failure(format!("{} ({})", err, ctx.stage));
        }
        if let Some(handler) = &self.crash_handler {
            handler(err, ctx);
        }
    }
}
