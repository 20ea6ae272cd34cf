//! Threshold rules: `<aggregator>(<args>) <comparator> <value>`.
//!
//! Accepted aggregators are `rate`, `p(N)` / `pN` / `percentile(N)`,
//! `mean` / `avg`, `med`, `min`, `max`, `count` and `value`. Whitespace
//! around tokens is optional, so `p(95)<500` and `p(95) < 500` are the same
//! rule. Comparators apply exactly: `<` is strict, `<=` inclusive, `==`
//! within `f64::EPSILON`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{MetricSnapshot, MetricsSnapshot};
use crate::error::{EmptyMetricError, MetricError, ThresholdParseError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    Rate,
    Percentile(f64),
    Mean,
    Min,
    Max,
    Count,
    Value,
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregator::Rate => f.write_str("rate"),
            Aggregator::Percentile(p) => write!(f, "p({})", p),
            Aggregator::Mean => f.write_str("avg"),
            Aggregator::Min => f.write_str("min"),
            Aggregator::Max => f.write_str("max"),
            Aggregator::Count => f.write_str("count"),
            Aggregator::Value => f.write_str("value"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl Comparator {
    pub fn holds(self, actual: f64, expected: f64) -> bool {
        match self {
            Comparator::Lt => actual < expected,
            Comparator::Le => actual <= expected,
            Comparator::Gt => actual > expected,
            Comparator::Ge => actual >= expected,
            Comparator::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub aggregator: Aggregator,
    pub comparator: Comparator,
    pub value: f64,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ThresholdParseError> {
        let fail = |reason: &str| ThresholdParseError {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, comparator, rhs) = split_comparator(expression)
            .ok_or_else(|| fail("expected one of <, <=, >, >=, =="))?;
        let aggregator = parse_aggregator(lhs.trim()).map_err(|reason| fail(&reason))?;
        let value = rhs
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| fail("right-hand side is not a number"))?;

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            aggregator,
            comparator,
            value,
        })
    }

    /// Measure this threshold's aggregate from the snapshot.
    pub fn measure(&self, snapshot: &MetricsSnapshot) -> Result<f64, MetricError> {
        let name = self.metric.as_str();
        match self.aggregator {
            Aggregator::Rate => snapshot.rate(name),
            Aggregator::Percentile(p) => snapshot.percentile(name, p),
            Aggregator::Mean => Ok(snapshot.trend(name)?.mean()?),
            Aggregator::Min => Ok(snapshot.trend(name)?.min()?),
            Aggregator::Max => Ok(snapshot.trend(name)?.max()?),
            Aggregator::Value => snapshot.counter_total(name),
            Aggregator::Count => match snapshot.get(name) {
                Some(MetricSnapshot::Counter { .. }) => snapshot.counter_total(name),
                Some(MetricSnapshot::Rate { total: 0, .. }) => Err(empty(name)),
                Some(MetricSnapshot::Rate { total, .. }) => Ok(*total as f64),
                Some(MetricSnapshot::Trend(t)) if t.is_empty() => Err(empty(name)),
                Some(MetricSnapshot::Trend(t)) => Ok(t.count() as f64),
                None => Err(MetricError::Unknown(name.to_string())),
            },
        }
    }

    /// Evaluate against the frozen snapshot.
    ///
    /// A metric that was never observed fails the threshold unless `lenient`
    /// is set; an observed-but-empty metric always fails.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot, lenient: bool) -> ThresholdResult {
        let (passed, measured, detail) = match self.measure(snapshot) {
            Ok(actual) => (self.comparator.holds(actual, self.value), Some(actual), None),
            Err(MetricError::Unknown(_)) if lenient => {
                (true, None, Some("metric never observed (lenient)".to_string()))
            }
            Err(e) => (false, None, Some(e.to_string())),
        };
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            passed,
            measured,
            detail,
        }
    }
}

fn empty(name: &str) -> MetricError {
    EmptyMetricError {
        metric: name.to_string(),
    }
    .into()
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} {}",
            self.metric, self.aggregator, self.comparator, self.value
        )
    }
}

fn split_comparator(expression: &str) -> Option<(&str, Comparator, &str)> {
    let at = expression.find(['<', '>', '='])?;
    let rest = &expression[at..];
    let (comparator, width) = if rest.starts_with("<=") {
        (Comparator::Le, 2)
    } else if rest.starts_with(">=") {
        (Comparator::Ge, 2)
    } else if rest.starts_with("==") {
        (Comparator::Eq, 2)
    } else if rest.starts_with('<') {
        (Comparator::Lt, 1)
    } else if rest.starts_with('>') {
        (Comparator::Gt, 1)
    } else {
        return None;
    };
    let rhs = &rest[width..];
    if rhs.contains(['<', '>', '=']) {
        return None;
    }
    Some((&expression[..at], comparator, rhs))
}

fn parse_aggregator(lhs: &str) -> Result<Aggregator, String> {
    let lhs = lhs.to_ascii_lowercase();
    let (name, arg) = match lhs.find('(') {
        Some(open) => {
            let close = lhs
                .rfind(')')
                .filter(|&c| c > open && c == lhs.len() - 1)
                .ok_or_else(|| format!("unbalanced parentheses in '{}'", lhs))?;
            (lhs[..open].trim().to_string(), Some(lhs[open + 1..close].trim().to_string()))
        }
        None => (lhs.clone(), None),
    };

    let percentile = |arg: &str| -> Result<Aggregator, String> {
        let p = arg
            .parse::<f64>()
            .map_err(|_| format!("percentile '{}' is not a number", arg))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(format!("percentile {} is outside [0, 100]", p));
        }
        Ok(Aggregator::Percentile(p))
    };

    let aggregator = match (name.as_str(), arg.as_deref()) {
        ("p" | "percentile", Some(arg)) => percentile(arg)?,
        ("rate", None) => Aggregator::Rate,
        ("mean" | "avg", None) => Aggregator::Mean,
        ("med", None) => Aggregator::Percentile(50.0),
        ("min", None) => Aggregator::Min,
        ("max", None) => Aggregator::Max,
        ("count", None) => Aggregator::Count,
        ("value", None) => Aggregator::Value,
        // Short form: p95, p99.9
        (short, None) if short.starts_with('p') && short.len() > 1 => percentile(&short[1..])?,
        (other, Some(_)) => return Err(format!("aggregator '{}' takes no argument", other)),
        (other, None) => return Err(format!("unknown aggregator '{}'", other)),
    };
    Ok(aggregator)
}

/// Parse the metric → expressions mapping from configuration.
pub fn parse_thresholds(
    criteria: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<Threshold>, ThresholdParseError> {
    criteria
        .iter()
        .flat_map(|(metric, expressions)| {
            expressions
                .iter()
                .map(move |expression| Threshold::parse(metric, expression))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub measured: Option<f64>,
    pub detail: Option<String>,
}

/// Evaluate every threshold. An empty list passes by definition.
pub fn evaluate_all(
    thresholds: &[Threshold],
    snapshot: &MetricsSnapshot,
    lenient: bool,
) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|t| t.evaluate(snapshot, lenient))
        .collect()
}

pub fn all_passed(results: &[ThresholdResult]) -> bool {
    results.iter().all(|r| r.passed)
}
