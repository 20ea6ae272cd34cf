//! Trend accumulation: distributions of numeric observations.
//!
//! Two storage modes trade memory for accuracy:
//!
//! * `Exact` keeps every sample until `capacity` is reached, then switches to
//!   uniform reservoir sampling (Algorithm R). Percentiles are exact below the
//!   capacity and a uniform-sample estimate above it. Memory is
//!   `8 * capacity` bytes per trend (8 MB at the default of 1M samples).
//! * `Histogram` records into an HDR histogram with 3 significant digits.
//!   Memory is constant (tens of KB) and every percentile is within 0.1% of
//!   the true value, which suits multi-hour soak runs.
//!
//! In both modes count, sum, min and max are tracked exactly.

use hdrhistogram::Histogram;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::EmptyMetricError;

pub const DEFAULT_RESERVOIR_CAPACITY: usize = 1_000_000;

/// Fixed-point scale for histogram storage: values are kept in thousandths.
const HISTOGRAM_SCALE: f64 = 1000.0;
/// One hour in milliseconds, expressed in thousandths.
const HISTOGRAM_HIGH: u64 = 60 * 60 * 1000 * 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrendStorage {
    #[default]
    Exact,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendConfig {
    pub storage: TrendStorage,
    pub reservoir_capacity: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            storage: TrendStorage::Exact,
            reservoir_capacity: DEFAULT_RESERVOIR_CAPACITY,
        }
    }
}

enum Samples {
    Reservoir {
        values: Vec<f64>,
        capacity: usize,
        rng: StdRng,
    },
    Histogram(Box<Histogram<u64>>),
}

/// Mutable accumulator behind a trend's lock.
pub struct TrendAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    samples: Samples,
}

impl TrendAccumulator {
    pub fn new(config: TrendConfig) -> Self {
        let reservoir = || Samples::Reservoir {
            values: Vec::new(),
            capacity: config.reservoir_capacity.max(1),
            rng: StdRng::from_entropy(),
        };
        let samples = match config.storage {
            TrendStorage::Exact => reservoir(),
            TrendStorage::Histogram => match Histogram::<u64>::new_with_bounds(1, HISTOGRAM_HIGH, 3) {
                Ok(h) => Samples::Histogram(Box::new(h)),
                Err(e) => {
                    tracing::warn!(error = %e, "Histogram unavailable, keeping exact samples");
                    reservoir()
                }
            },
        };
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples,
        }
    }

    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        match &mut self.samples {
            Samples::Reservoir {
                values,
                capacity,
                rng,
            } => {
                if values.len() < *capacity {
                    values.push(value);
                } else {
                    // Algorithm R: keep each of the first `count` samples with equal probability
                    let slot = rng.gen_range(0..self.count);
                    if (slot as usize) < *capacity {
                        values[slot as usize] = value;
                    }
                }
            }
            Samples::Histogram(h) => {
                let scaled = (value.max(0.0) * HISTOGRAM_SCALE).round() as u64;
                h.saturating_record(scaled.max(1));
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Freeze the accumulator into an immutable, query-ready snapshot.
    pub fn snapshot(&self, name: &str) -> TrendSnapshot {
        let distribution = match &self.samples {
            Samples::Reservoir { values, .. } => {
                let mut sorted = values.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                Distribution::Sorted(sorted)
            }
            Samples::Histogram(h) => Distribution::Histogram(h.clone()),
        };
        TrendSnapshot {
            name: name.to_string(),
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            distribution,
        }
    }
}

#[derive(Debug, Clone)]
enum Distribution {
    Sorted(Vec<f64>),
    Histogram(Box<Histogram<u64>>),
}

/// Frozen view of one trend.
#[derive(Debug, Clone)]
pub struct TrendSnapshot {
    name: String,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    distribution: Distribution,
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn ensure_observed(&self) -> Result<(), EmptyMetricError> {
        if self.is_empty() {
            Err(EmptyMetricError {
                metric: self.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    pub fn min(&self) -> Result<f64, EmptyMetricError> {
        self.ensure_observed()?;
        Ok(self.min)
    }

    pub fn max(&self) -> Result<f64, EmptyMetricError> {
        self.ensure_observed()?;
        Ok(self.max)
    }

    pub fn mean(&self) -> Result<f64, EmptyMetricError> {
        self.ensure_observed()?;
        Ok(self.sum / self.count as f64)
    }

    /// Percentile `p` in [0, 100] by linear interpolation between closest ranks.
    ///
    /// `p <= 0` is the exact minimum and `p >= 100` the exact maximum.
    pub fn percentile(&self, p: f64) -> Result<f64, EmptyMetricError> {
        self.ensure_observed()?;
        if p <= 0.0 {
            return Ok(self.min);
        }
        if p >= 100.0 {
            return Ok(self.max);
        }

        let value = match &self.distribution {
            Distribution::Sorted(sorted) => {
                let rank = p / 100.0 * (sorted.len() - 1) as f64;
                let lower = rank.floor() as usize;
                let upper = rank.ceil() as usize;
                let weight = rank - lower as f64;
                sorted[lower] + (sorted[upper] - sorted[lower]) * weight
            }
            Distribution::Histogram(h) => {
                h.value_at_quantile(p / 100.0) as f64 / HISTOGRAM_SCALE
            }
        };
        Ok(value.clamp(self.min, self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> TrendAccumulator {
        TrendAccumulator::new(TrendConfig::default())
    }

    #[test]
    fn test_percentile_interpolates_between_ranks() {
        let mut acc = exact();
        for v in (1..=10).map(|i| (i * 100) as f64) {
            acc.record(v);
        }
        let snap = acc.snapshot("t");
        // rank = 0.95 * 9 = 8.55 -> 900 + 0.55 * 100
        assert!((snap.percentile(95.0).unwrap() - 955.0).abs() < 1e-9);
        assert!((snap.percentile(50.0).unwrap() - 550.0).abs() < 1e-9);
        assert_eq!(snap.percentile(0.0).unwrap(), 100.0);
        assert_eq!(snap.percentile(100.0).unwrap(), 1000.0);
        assert_eq!(snap.mean().unwrap(), 550.0);
    }

    #[test]
    fn test_single_sample() {
        let mut acc = exact();
        acc.record(42.0);
        let snap = acc.snapshot("t");
        assert_eq!(snap.percentile(99.0).unwrap(), 42.0);
        assert_eq!(snap.min().unwrap(), 42.0);
        assert_eq!(snap.max().unwrap(), 42.0);
    }

    #[test]
    fn test_empty_trend_is_an_error() {
        let snap = exact().snapshot("login_duration");
        let err = snap.percentile(95.0).unwrap_err();
        assert_eq!(err.metric, "login_duration");
        assert!(snap.mean().is_err());
        assert!(snap.min().is_err());
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let mut acc = exact();
        acc.record(f64::NAN);
        acc.record(f64::INFINITY);
        assert_eq!(acc.count(), 0);
    }

    #[test]
    fn test_reservoir_stays_bounded_but_extremes_exact() {
        let mut acc = TrendAccumulator::new(TrendConfig {
            storage: TrendStorage::Exact,
            reservoir_capacity: 100,
        });
        for i in 0..10_000 {
            acc.record(i as f64);
        }
        if let Samples::Reservoir { values, .. } = &acc.samples {
            assert_eq!(values.len(), 100);
        } else {
            panic!("expected reservoir storage");
        }
        let snap = acc.snapshot("t");
        assert_eq!(snap.count(), 10_000);
        assert_eq!(snap.percentile(0.0).unwrap(), 0.0);
        assert_eq!(snap.percentile(100.0).unwrap(), 9999.0);
        // A uniform sample of 100 should put the median well inside the middle half
        let median = snap.percentile(50.0).unwrap();
        assert!((2500.0..7500.0).contains(&median), "median was {}", median);
    }

    #[test]
    fn test_histogram_mode_bounded_error() {
        let mut acc = TrendAccumulator::new(TrendConfig {
            storage: TrendStorage::Histogram,
            reservoir_capacity: 0,
        });
        for i in 1..=1000 {
            acc.record(i as f64);
        }
        let snap = acc.snapshot("t");
        let p95 = snap.percentile(95.0).unwrap();
        assert!((p95 - 950.0).abs() / 950.0 < 0.002, "p95 was {}", p95);
        assert_eq!(snap.percentile(100.0).unwrap(), 1000.0);
        assert_eq!(snap.percentile(0.0).unwrap(), 1.0);
        assert_eq!(snap.count(), 1000);
    }
}
