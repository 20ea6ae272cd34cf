use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub mod report;
pub mod threshold;
pub mod trend;

pub use trend::{TrendConfig, TrendSnapshot, TrendStorage};

use crate::error::{EmptyMetricError, MetricError};
use trend::TrendAccumulator;

/// Built-in metric names recorded by the engine for every iteration.
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATION_FAILED: &str = "iteration_failed";
pub const ITERATIONS_REJECTED: &str = "iterations_rejected";

/// Rate of every named check across all scenarios.
pub const CHECKS: &str = "checks";

/// Rate of one named check, e.g. `check::status is 200`.
pub fn check_metric(check: &str) -> String {
    format!("check::{}", check)
}

/// Metric name for a scenario-scoped series, e.g. `scenario::deposit::duration`.
pub fn scenario_metric(scenario: &str, series: &str) -> String {
    format!("scenario::{}::{}", scenario, series)
}

/// Metric name for a step-scoped series, e.g. `step::deposit::login::skipped`.
pub fn step_metric(scenario: &str, step: &str, series: &str) -> String {
    format!("step::{}::{}::{}", scenario, step, series)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct CounterCell {
    total: f64,
    observations: u64,
}

#[derive(Debug, Default)]
struct RateCell {
    trues: u64,
    total: u64,
}

/// Per-name accumulation structure; each carries its own lock.
enum MetricCell {
    Counter(Mutex<CounterCell>),
    Rate(Mutex<RateCell>),
    Trend(Mutex<TrendAccumulator>),
}

impl MetricCell {
    fn kind(&self) -> MetricKind {
        match self {
            MetricCell::Counter(_) => MetricKind::Counter,
            MetricCell::Rate(_) => MetricKind::Rate,
            MetricCell::Trend(_) => MetricKind::Trend,
        }
    }
}

/// Thread-safe metrics registry.
///
/// The name index is behind a read-mostly lock that is only written when a
/// metric is first observed. Each metric then has its own lock, held only for
/// the update itself, so writers to different metrics never contend and
/// writers to the same metric serialize per observation.
pub struct MetricsRegistry {
    cells: RwLock<HashMap<String, Arc<MetricCell>>>,
    trend_config: TrendConfig,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(TrendConfig::default())
    }
}

impl MetricsRegistry {
    pub fn new(trend_config: TrendConfig) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            trend_config,
        }
    }

    fn cell(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricCell>, MetricError> {
        if let Some(cell) = self.cells.read().get(name) {
            return Self::check_kind(name, cell, kind);
        }

        let mut cells = self.cells.write();
        // Another writer may have created it between the two locks
        let cell = cells.entry(name.to_string()).or_insert_with(|| {
            Arc::new(match kind {
                MetricKind::Counter => MetricCell::Counter(Mutex::new(CounterCell::default())),
                MetricKind::Rate => MetricCell::Rate(Mutex::new(RateCell::default())),
                MetricKind::Trend => {
                    MetricCell::Trend(Mutex::new(TrendAccumulator::new(self.trend_config)))
                }
            })
        });
        Self::check_kind(name, cell, kind)
    }

    fn check_kind(
        name: &str,
        cell: &Arc<MetricCell>,
        expected: MetricKind,
    ) -> Result<Arc<MetricCell>, MetricError> {
        if cell.kind() == expected {
            Ok(cell.clone())
        } else {
            Err(MetricError::KindMismatch {
                name: name.to_string(),
                expected,
                actual: cell.kind(),
            })
        }
    }

    /// Register a metric without observing it, so queries see it as empty
    /// rather than unknown.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        self.cell(name, kind).map(|_| ())
    }

    /// Add `delta` to a counter. A zero delta still counts as an observation.
    pub fn record_counter(&self, name: &str, delta: f64) -> Result<(), MetricError> {
        if delta < 0.0 || !delta.is_finite() {
            return Err(MetricError::NegativeDelta {
                name: name.to_string(),
                delta,
            });
        }
        if let MetricCell::Counter(total) = &*self.cell(name, MetricKind::Counter)? {
            let mut counter = total.lock();
            counter.total += delta;
            counter.observations += 1;
        }
        Ok(())
    }

    pub fn record_rate(&self, name: &str, success: bool) -> Result<(), MetricError> {
        if let MetricCell::Rate(rate) = &*self.cell(name, MetricKind::Rate)? {
            let mut rate = rate.lock();
            rate.total += 1;
            if success {
                rate.trues += 1;
            }
        }
        Ok(())
    }

    pub fn record_trend(&self, name: &str, value: f64) -> Result<(), MetricError> {
        if let MetricCell::Trend(trend) = &*self.cell(name, MetricKind::Trend)? {
            trend.lock().record(value);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every metric into an immutable snapshot.
    ///
    /// Taken while writers are still running, each metric is internally
    /// consistent but metrics are not captured at a single instant.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let cells: Vec<(String, Arc<MetricCell>)> = self
            .cells
            .read()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.clone()))
            .collect();

        let metrics = cells
            .into_iter()
            .map(|(name, cell)| {
                let value = match &*cell {
                    MetricCell::Counter(counter) => {
                        let counter = counter.lock();
                        MetricSnapshot::Counter {
                            total: counter.total,
                            observations: counter.observations,
                        }
                    }
                    MetricCell::Rate(rate) => {
                        let rate = rate.lock();
                        MetricSnapshot::Rate {
                            trues: rate.trues,
                            total: rate.total,
                        }
                    }
                    MetricCell::Trend(trend) => MetricSnapshot::Trend(trend.lock().snapshot(&name)),
                };
                (name, value)
            })
            .collect();

        MetricsSnapshot { metrics }
    }
}

#[derive(Debug, Clone)]
pub enum MetricSnapshot {
    Counter { total: f64, observations: u64 },
    Rate { trues: u64, total: u64 },
    Trend(TrendSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Counter { .. } => MetricKind::Counter,
            MetricSnapshot::Rate { .. } => MetricKind::Rate,
            MetricSnapshot::Trend(_) => MetricKind::Trend,
        }
    }
}

/// Frozen metrics, queried by the threshold evaluator and the run report.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    metrics: BTreeMap<String, MetricSnapshot>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricSnapshot)> {
        self.metrics.iter()
    }

    fn lookup(&self, name: &str, kind: MetricKind) -> Result<&MetricSnapshot, MetricError> {
        let metric = self
            .metrics
            .get(name)
            .ok_or_else(|| MetricError::Unknown(name.to_string()))?;
        if metric.kind() != kind {
            return Err(MetricError::KindMismatch {
                name: name.to_string(),
                expected: kind,
                actual: metric.kind(),
            });
        }
        Ok(metric)
    }

    /// Counter total; a declared counter that was never recorded is empty.
    pub fn counter_total(&self, name: &str) -> Result<f64, MetricError> {
        match self.lookup(name, MetricKind::Counter)? {
            MetricSnapshot::Counter { observations: 0, .. } => Err(EmptyMetricError {
                metric: name.to_string(),
            }
            .into()),
            MetricSnapshot::Counter { total, .. } => Ok(*total),
            _ => unreachable!("kind checked by lookup"),
        }
    }

    /// Fraction of true observations; empty rates are an error.
    pub fn rate(&self, name: &str) -> Result<f64, MetricError> {
        match self.lookup(name, MetricKind::Rate)? {
            MetricSnapshot::Rate { total: 0, .. } => Err(EmptyMetricError {
                metric: name.to_string(),
            }
            .into()),
            MetricSnapshot::Rate { trues, total } => Ok(*trues as f64 / *total as f64),
            _ => unreachable!("kind checked by lookup"),
        }
    }

    pub fn trend(&self, name: &str) -> Result<&TrendSnapshot, MetricError> {
        match self.lookup(name, MetricKind::Trend)? {
            MetricSnapshot::Trend(t) => Ok(t),
            _ => unreachable!("kind checked by lookup"),
        }
    }

    pub fn percentile(&self, name: &str, p: f64) -> Result<f64, MetricError> {
        Ok(self.trend(name)?.percentile(p)?)
    }

    /// Condensed per-metric values for the run report.
    pub fn summaries(&self) -> BTreeMap<String, MetricSummary> {
        self.metrics
            .iter()
            .map(|(name, metric)| (name.clone(), MetricSummary::from(metric)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        total: f64,
    },
    Rate {
        rate: Option<f64>,
        trues: u64,
        total: u64,
    },
    Trend {
        count: u64,
        min: Option<f64>,
        max: Option<f64>,
        avg: Option<f64>,
        med: Option<f64>,
        p90: Option<f64>,
        p95: Option<f64>,
        p99: Option<f64>,
    },
}

impl From<&MetricSnapshot> for MetricSummary {
    fn from(metric: &MetricSnapshot) -> Self {
        match metric {
            MetricSnapshot::Counter { total, .. } => MetricSummary::Counter { total: *total },
            MetricSnapshot::Rate { trues, total } => MetricSummary::Rate {
                rate: (*total > 0).then(|| *trues as f64 / *total as f64),
                trues: *trues,
                total: *total,
            },
            MetricSnapshot::Trend(t) => MetricSummary::Trend {
                count: t.count(),
                min: t.min().ok(),
                max: t.max().ok(),
                avg: t.mean().ok(),
                med: t.percentile(50.0).ok(),
                p90: t.percentile(90.0).ok(),
                p95: t.percentile(95.0).ok(),
                p99: t.percentile(99.0).ok(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_accumulates() {
        let registry = MetricsRegistry::default();
        registry.record_counter(ITERATIONS, 1.0).unwrap();
        registry.record_counter(ITERATIONS, 2.5).unwrap();
        let snap = registry.snapshot();
        assert_eq!(snap.counter_total(ITERATIONS).unwrap(), 3.5);
    }

    #[test]
    fn test_counter_rejects_negative_delta() {
        let registry = MetricsRegistry::default();
        let err = registry.record_counter("errors", -1.0).unwrap_err();
        assert!(matches!(err, MetricError::NegativeDelta { .. }));
    }

    #[test]
    fn test_rate() {
        let registry = MetricsRegistry::default();
        for i in 0..100 {
            registry.record_rate("errors", i < 5).unwrap();
        }
        let snap = registry.snapshot();
        assert!((snap.rate("errors").unwrap() - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_kind_mismatch() {
        let registry = MetricsRegistry::default();
        registry.record_trend("login_duration", 12.0).unwrap();
        let err = registry.record_rate("login_duration", true).unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                name: "login_duration".to_string(),
                expected: MetricKind::Rate,
                actual: MetricKind::Trend,
            }
        );
        let snap = registry.snapshot();
        assert!(matches!(
            snap.counter_total("login_duration"),
            Err(MetricError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_and_declared_metrics() {
        let registry = MetricsRegistry::default();
        registry.declare(ITERATION_DURATION, MetricKind::Trend).unwrap();
        registry.declare(ITERATION_FAILED, MetricKind::Rate).unwrap();
        let snap = registry.snapshot();

        assert_eq!(
            snap.percentile("missing", 95.0),
            Err(MetricError::Unknown("missing".to_string()))
        );
        assert!(matches!(
            snap.percentile(ITERATION_DURATION, 95.0),
            Err(MetricError::Empty(_))
        ));
        assert!(matches!(snap.rate(ITERATION_FAILED), Err(MetricError::Empty(_))));
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        const WORKERS: usize = 16;
        const PER_WORKER: usize = 5_000;

        let registry = Arc::new(MetricsRegistry::default());
        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..PER_WORKER {
                        let value = (w * PER_WORKER + i) as f64;
                        registry.record_trend(ITERATION_DURATION, value).unwrap();
                        registry.record_rate(ITERATION_FAILED, i % 2 == 0).unwrap();
                        registry.record_counter(ITERATIONS, 1.0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = registry.snapshot();
        let trend = snap.trend(ITERATION_DURATION).unwrap();
        assert_eq!(trend.count(), (WORKERS * PER_WORKER) as u64);
        assert_eq!(
            snap.counter_total(ITERATIONS).unwrap(),
            (WORKERS * PER_WORKER) as f64
        );
        assert_eq!(snap.rate(ITERATION_FAILED).unwrap(), 0.5);
        assert_eq!(trend.percentile(0.0).unwrap(), 0.0);
        assert_eq!(
            trend.percentile(100.0).unwrap(),
            (WORKERS * PER_WORKER - 1) as f64
        );
    }

    #[test]
    fn test_declared_counter_is_empty_until_recorded() {
        let registry = MetricsRegistry::default();
        registry.declare(ITERATIONS_REJECTED, MetricKind::Counter).unwrap();
        assert!(matches!(
            registry.snapshot().counter_total(ITERATIONS_REJECTED),
            Err(MetricError::Empty(_))
        ));

        registry.record_counter(ITERATIONS_REJECTED, 0.0).unwrap();
        assert_eq!(registry.snapshot().counter_total(ITERATIONS_REJECTED).unwrap(), 0.0);
    }

    #[test]
    fn test_summaries() {
        let registry = MetricsRegistry::default();
        for v in [10.0, 20.0, 30.0] {
            registry.record_trend("t", v).unwrap();
        }
        registry.declare("r", MetricKind::Rate).unwrap();
        let summaries = registry.snapshot().summaries();

        match &summaries["t"] {
            MetricSummary::Trend { count, avg, med, max, .. } => {
                assert_eq!(*count, 3);
                assert_eq!(*avg, Some(20.0));
                assert_eq!(*med, Some(20.0));
                assert_eq!(*max, Some(30.0));
            }
            other => panic!("unexpected summary {:?}", other),
        }
        assert_eq!(
            summaries["r"],
            MetricSummary::Rate {
                rate: None,
                trues: 0,
                total: 0
            }
        );
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(scenario_metric("deposit", "failed"), "scenario::deposit::failed");
        assert_eq!(check_metric("login has token"), "check::login has token");
        assert_eq!(
            step_metric("deposit", "login", "skipped"),
            "step::deposit::login::skipped"
        );
    }
}
