use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::threshold::ThresholdResult;
use super::{MetricSummary, MetricsSnapshot};
use crate::utils::format_duration;

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
pub const EXIT_INVALID_CONFIG: i32 = 104;
pub const EXIT_ABORTED: i32 = 105;
pub const EXIT_SETUP_FAILED: i32 = 107;

/// Run lifecycle: `Idle → Setup → Running → TearingDown → Evaluated → {Passed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Setup,
    Running,
    TearingDown,
    Evaluated,
    Passed,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Setup => "setup",
            RunPhase::Running => "running",
            RunPhase::TearingDown => "tearing_down",
            RunPhase::Evaluated => "evaluated",
            RunPhase::Passed => "passed",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    /// Setup hook failed; Running never started.
    Setup,
    /// Operator stop (control command or signal).
    External,
    /// The pool could not hold the scheduled concurrency.
    PoolResource,
}

/// Why Running ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RunEnd {
    /// The stage schedule ran to its end.
    Completed,
    /// The run-level wall-clock limit fired first.
    TimedOut,
    Aborted { cause: AbortCause, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMark {
    pub phase: RunPhase,
    /// Offset from the start of the run in milliseconds.
    pub at_ms: u64,
}

impl PhaseMark {
    pub fn at(&self) -> Duration {
        Duration::from_millis(self.at_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub verdict: Verdict,
    pub end: RunEnd,
    pub phases: Vec<PhaseMark>,
    pub peak_vus: usize,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
    /// Full snapshot for further queries; not serialized.
    #[serde(skip)]
    pub snapshot: MetricsSnapshot,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }

    /// When `phase` was entered, if it was.
    pub fn phase_at(&self, phase: RunPhase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|m| m.phase == phase)
            .map(PhaseMark::at)
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.end, self.verdict) {
            (RunEnd::Aborted { cause: AbortCause::Setup, .. }, _) => EXIT_SETUP_FAILED,
            (RunEnd::Aborted { .. }, _) => EXIT_ABORTED,
            (_, Verdict::Passed) => EXIT_PASSED,
            (_, Verdict::Failed) => EXIT_THRESHOLDS_FAILED,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn report(&self) {
        println!("\n--- Run Summary ---");
        println!(
            "Started: {}  Elapsed: {}  Peak VUs: {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_duration(Duration::from_millis(self.elapsed_ms)),
            self.peak_vus
        );
        match &self.end {
            RunEnd::Completed => println!("Schedule: completed"),
            RunEnd::TimedOut => println!("Schedule: cut short by run timeout"),
            RunEnd::Aborted { cause, message } => {
                println!("Schedule: ABORTED ({:?}): {}", cause, message)
            }
        }

        println!("\nPhases:");
        let timeline: Vec<String> = self
            .phases
            .iter()
            .map(|m| format!("{}@{}", m.phase, format_duration(m.at())))
            .collect();
        println!("  {}", timeline.join(" -> "));

        if !self.metrics.is_empty() {
            println!("\nMetrics:");
            for (name, summary) in &self.metrics {
                println!("  {:<40} {}", name, summary);
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                let measured = t
                    .measured
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_else(|| "n/a".to_string());
                print!("  {} {} {} (actual: {})", mark, t.metric, t.expression, measured);
                match &t.detail {
                    Some(detail) => println!(" [{}]", detail),
                    None => println!(),
                }
            }
        }

        println!(
            "\nVerdict: {}",
            match self.verdict {
                Verdict::Passed => "PASSED",
                Verdict::Failed => "FAILED",
            }
        );
        println!("--------------------\n");
    }
}

fn opt(v: Option<f64>) -> String {
    v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for MetricSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSummary::Counter { total } => write!(f, "total={}", total),
            MetricSummary::Rate { rate, trues, total } => write!(
                f,
                "rate={} ({}/{})",
                rate.map(|r| format!("{:.2}%", r * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
                trues,
                total
            ),
            MetricSummary::Trend {
                count,
                min,
                max,
                avg,
                med,
                p90,
                p95,
                p99,
            } => write!(
                f,
                "count={} avg={} min={} med={} max={} p(90)={} p(95)={} p(99)={}",
                count,
                opt(*avg),
                opt(*min),
                opt(*med),
                opt(*max),
                opt(*p90),
                opt(*p95),
                opt(*p99)
            ),
        }
    }
}
