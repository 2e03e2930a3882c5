//! Runner configuration, `envconfig`-derived like `ingestion-consumer::Config`
//! and nesting `common_kafka::config::ConsumerConfig`/`KafkaConfig` rather
//! than redefining broker/consumer-group settings.

use std::time::Duration;

use envconfig::Envconfig;

pub use common_kafka::config::{ConsumerConfig, KafkaConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct RunnerConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    /// Auto-resolve the batch's last offset once the batch handler returns,
    /// unless the handler already resolved further offsets itself.
    #[envconfig(from = "EACH_BATCH_AUTO_RESOLVE", default = "true")]
    pub each_batch_auto_resolve: bool,

    /// Permit periodic and post-cycle commits.
    #[envconfig(from = "AUTO_COMMIT", default = "true")]
    pub auto_commit: bool,

    /// Parallel partition batch-processing cap.
    #[envconfig(from = "PARTITIONS_CONSUMED_CONCURRENTLY", default = "1")]
    pub partitions_consumed_concurrently: usize,

    /// Minimum milliseconds between heartbeats.
    #[envconfig(from = "HEARTBEAT_INTERVAL_MS", default = "3000")]
    pub heartbeat_interval_ms: u64,

    /// Commit at least every N successfully-processed messages, in addition
    /// to the time-based threshold below. The distilled spec names this
    /// threshold without pinning a default; see DESIGN.md.
    #[envconfig(from = "COMMIT_OFFSETS_EVERY_N_MESSAGES", default = "100")]
    pub commit_offsets_every_n_messages: u64,

    /// Commit at least every N milliseconds once any offset is resolved.
    #[envconfig(from = "COMMIT_OFFSETS_INTERVAL_MS", default = "5000")]
    pub commit_offsets_interval_ms: u64,

    #[envconfig(from = "RUNNER_MAX_RETRIES", default = "10")]
    pub max_retries: u32,

    #[envconfig(from = "RUNNER_RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(from = "RUNNER_RETRY_INITIAL_INTERVAL_MS", default = "300")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(from = "RUNNER_RETRY_MAX_INTERVAL_MS", default = "30000")]
    pub retry_max_interval_ms: u64,

    /// Injected by the test harness; replaces the source's global
    /// `NODE_ENV === 'test'` check. When true, `stop()` does not poll
    /// `consuming` and returns as soon as `running` is cleared, avoiding
    /// leaked timers in tests that never drive a real fetch loop.
    #[envconfig(from = "RUNNER_TEST_MODE", default = "false")]
    pub test_mode: bool,
}

impl RunnerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn commit_offsets_interval(&self) -> Duration {
        Duration::from_millis(self.commit_offsets_interval_ms)
    }

    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_retries: self.max_retries,
            backoff_coefficient: self.retry_backoff_coefficient,
            initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
            maximum_interval: Some(Duration::from_millis(self.retry_max_interval_ms)),
        }
    }
}
