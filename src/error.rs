//! Error taxonomy for the run lifecycle.
//!
//! Per-iteration failures (`ScenarioError`) never leave the VU loop; they are
//! recorded as metric observations. Everything else surfaces through
//! `EngineError` and decides the run's terminal verdict.

use thiserror::Error;

use crate::stats::MetricKind;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid load profile, raised before Running starts.
    #[error("invalid load profile: {0}")]
    SchedulerConfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Setup(#[from] SetupError),

    /// The pool could not hold the scheduled concurrency.
    #[error("cannot maintain {target} virtual users: {reason}")]
    PoolResource { target: usize, reason: String },

    #[error(transparent)]
    Threshold(#[from] ThresholdParseError),
}

#[derive(Debug, Error)]
#[error("setup failed: {0:#}")]
pub struct SetupError(#[source] pub anyhow::Error);

#[derive(Debug, Error)]
#[error("teardown failed: {0:#}")]
pub struct TeardownError(#[source] pub anyhow::Error);

/// A single iteration's business logic failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("scenario panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A query needed at least one observation and the metric has none.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("metric '{metric}' has no observations")]
pub struct EmptyMetricError {
    pub metric: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("metric '{name}' is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: MetricKind,
        actual: MetricKind,
    },

    #[error("counter '{name}' cannot decrease (delta {delta})")]
    NegativeDelta { name: String, delta: f64 },

    #[error("metric '{0}' was never observed")]
    Unknown(String),

    #[error(transparent)]
    Empty(#[from] EmptyMetricError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse threshold '{expression}' for metric '{metric}': {reason}")]
pub struct ThresholdParseError {
    pub metric: String,
    pub expression: String,
    pub reason: String,
}
