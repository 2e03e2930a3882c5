//! Error taxonomy for the consumer runner.
//!
//! `KafkaErrorKind` realizes the classification table from the component
//! design doc: every error surfaced by the `ConsumerGroup` collaborator maps
//! onto one of these kinds, and the scheduler/join driver branch on the kind
//! alone, never on the underlying error type.

use std::fmt;

use thiserror::Error;

/// Classification of an error surfaced by the `ConsumerGroup` collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KafkaErrorKind {
    /// `REBALANCE_IN_PROGRESS`: recovered by re-joining, not bailed.
    RebalanceInProgress,
    /// `NOT_COORDINATOR_FOR_GROUP`: recovered by re-joining, not bailed.
    NotCoordinatorForGroup,
    /// `UNKNOWN_MEMBER_ID`: member id is cleared and the group is re-joined.
    UnknownMemberId,
    /// `KafkaJSOffsetOutOfRange`: the collaborator already repositioned the
    /// cursor; swallow and proceed to the next cycle.
    OffsetOutOfRange,
    /// `KafkaJSNotImplemented`: always fatal.
    NotImplemented,
    /// Anything else: opaque, handled generically (retried, then fatal).
    Other,
}

impl KafkaErrorKind {
    /// Classify a raw `rdkafka` error using its broker-reported error code.
    pub fn from_rdkafka(err: &rdkafka::error::KafkaError) -> Self {
        use rdkafka::types::RDKafkaErrorCode as Code;
        match err.rdkafka_error_code() {
            Some(Code::RebalanceInProgress) => KafkaErrorKind::RebalanceInProgress,
            Some(Code::NotCoordinator) => KafkaErrorKind::NotCoordinatorForGroup,
            Some(Code::UnknownMemberId) => KafkaErrorKind::UnknownMemberId,
            Some(Code::OffsetOutOfRange) => KafkaErrorKind::OffsetOutOfRange,
            _ => KafkaErrorKind::Other,
        }
    }

    /// Classify by the string identifiers named in the external-interfaces
    /// section, for `ConsumerGroup` implementations (test doubles included)
    /// that don't speak `rdkafka` error codes directly.
    pub fn from_name(name: &str) -> Self {
        match name {
            "REBALANCE_IN_PROGRESS" => KafkaErrorKind::RebalanceInProgress,
            "NOT_COORDINATOR_FOR_GROUP" => KafkaErrorKind::NotCoordinatorForGroup,
            "UNKNOWN_MEMBER_ID" => KafkaErrorKind::UnknownMemberId,
            "KafkaJSOffsetOutOfRange" => KafkaErrorKind::OffsetOutOfRange,
            "KafkaJSNotImplemented" => KafkaErrorKind::NotImplemented,
            _ => KafkaErrorKind::Other,
        }
    }

    pub fn is_rebalance_signal(self) -> bool {
        matches!(
            self,
            KafkaErrorKind::RebalanceInProgress | KafkaErrorKind::NotCoordinatorForGroup
        )
    }
}

impl fmt::Display for KafkaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KafkaErrorKind::RebalanceInProgress => "REBALANCE_IN_PROGRESS",
            KafkaErrorKind::NotCoordinatorForGroup => "NOT_COORDINATOR_FOR_GROUP",
            KafkaErrorKind::UnknownMemberId => "UNKNOWN_MEMBER_ID",
            KafkaErrorKind::OffsetOutOfRange => "KafkaJSOffsetOutOfRange",
            KafkaErrorKind::NotImplemented => "KafkaJSNotImplemented",
            KafkaErrorKind::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// Error returned by `ConsumerGroup` operations, carrying enough
/// classification for the scheduler and join driver to act without
/// downcasting.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct GroupError {
    pub kind: KafkaErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl GroupError {
    pub fn new(kind: KafkaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_rdkafka(err: rdkafka::error::KafkaError) -> Self {
        let kind = KafkaErrorKind::from_rdkafka(&err);
        Self {
            message: err.to_string(),
            kind,
            source: Some(err.into()),
        }
    }

    pub fn other(err: anyhow::Error) -> Self {
        Self {
            kind: KafkaErrorKind::Other,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Context attached to a fatal error on its way to `on_crash`, so a consuming
/// binary can report *where* the runner died without parsing the message.
#[derive(Debug, Clone)]
pub struct CrashContext {
    pub stage: &'static str,
    pub retries_attempted: u32,
}

/// Top-level error type for runner operations that can fail outright
/// (as opposed to being recovered internally by the scheduler).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("kafka group error: {0}")]
    Group(#[from] GroupError),

    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("retries exhausted after {retries} attempts: {source}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RunnerError {
    /// Best-effort classification of the underlying cause, used by the
    /// scheduler to decide on recovery vs. bail without matching on variants
    /// at every call site.
    pub fn kafka_kind(&self) -> KafkaErrorKind {
        match self {
            RunnerError::Group(e) => e.kind,
            _ => KafkaErrorKind::Other,
        }
    }
}
