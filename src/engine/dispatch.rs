//! Weighted scenario selection and single-iteration execution.
//!
//! Selection uses one normalized cumulative-weight table and a single uniform
//! draw, so adding or removing a scenario only means rebuilding the set.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{EngineError, MetricError, ScenarioError};
use crate::stats::{
    check_metric, scenario_metric, step_metric, MetricKind, MetricsRegistry, CHECKS, ITERATIONS,
    ITERATIONS_REJECTED, ITERATION_DURATION, ITERATION_FAILED,
};

/// What a scenario body reports when it returns normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Expected business rejection (e.g. insufficient funds): not a success,
    /// not an error.
    Rejected(String),
}

/// A named unit of simulated client behavior.
///
/// `F` is the fixture produced by setup and shared read-only by every VU.
pub trait Scenario<F>: Send + Sync {
    fn name(&self) -> &str;

    /// Steps this scenario may run, in order. Declared steps that were not
    /// attempted in a failed iteration are recorded as skipped.
    fn steps(&self) -> &[&'static str] {
        &[]
    }

    fn run(&self, ctx: &mut IterationContext<'_, F>) -> Result<Verdict, ScenarioError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    /// Not attempted because a prerequisite step failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Per-iteration state handed to a scenario body. Nothing in it survives the
/// iteration; a session token obtained in one iteration must be re-derived in
/// the next.
pub struct IterationContext<'a, F> {
    pub vu: usize,
    pub iteration: u64,
    pub fixture: &'a F,
    pub rng: &'a mut dyn rand::RngCore,
    metrics: &'a MetricsRegistry,
    steps: Vec<StepRecord>,
}

impl<'a, F> IterationContext<'a, F> {
    pub fn new(
        vu: usize,
        iteration: u64,
        fixture: &'a F,
        metrics: &'a MetricsRegistry,
        rng: &'a mut dyn rand::RngCore,
    ) -> Self {
        Self {
            vu,
            iteration,
            fixture,
            rng,
            metrics,
            steps: Vec::new(),
        }
    }

    /// Registry for custom metrics (e.g. an `errors` rate).
    pub fn metrics(&self) -> &MetricsRegistry {
        self.metrics
    }

    /// Record a named assertion into `checks` and `check::<name>`.
    ///
    /// Checks are observations only: a failed check does not fail the
    /// iteration. Returns `passed` so callers can branch on it.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        let recorded = self
            .metrics
            .record_rate(CHECKS, passed)
            .and_then(|_| self.metrics.record_rate(&check_metric(name), passed));
        if let Err(e) = recorded {
            warn!(check = name, error = %e, "Failed to record check");
        }
        passed
    }

    /// Run one timed step. A failed step is recorded and returned as
    /// `ScenarioError::Step`, so `?` stops dependent steps from running.
    pub fn step<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> anyhow::Result<T>,
    ) -> Result<T, ScenarioError> {
        let started = Instant::now();
        let result = f(self);
        let duration = started.elapsed();
        match result {
            Ok(value) => {
                self.steps.push(StepRecord {
                    name: name.to_string(),
                    status: StepStatus::Passed,
                    duration,
                    error: None,
                });
                Ok(value)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.steps.push(StepRecord {
                    name: name.to_string(),
                    status: StepStatus::Failed,
                    duration,
                    error: Some(message.clone()),
                });
                Err(ScenarioError::Step {
                    step: name.to_string(),
                    message,
                })
            }
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Rejected,
    Failed,
}

/// Structured result of one dispatched iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub scenario: String,
    pub status: OutcomeStatus,
    pub duration: Duration,
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
}

impl IterationOutcome {
    pub fn success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Record into the built-in iteration, scenario and step series.
    pub fn record(&self, registry: &MetricsRegistry) -> Result<(), MetricError> {
        let millis = self.duration.as_secs_f64() * 1000.0;
        let failed = self.status == OutcomeStatus::Failed;

        registry.record_counter(ITERATIONS, 1.0)?;
        registry.record_trend(ITERATION_DURATION, millis)?;
        registry.record_rate(ITERATION_FAILED, failed)?;
        let rejected = if self.status == OutcomeStatus::Rejected { 1.0 } else { 0.0 };
        registry.record_counter(ITERATIONS_REJECTED, rejected)?;

        registry.record_trend(&scenario_metric(&self.scenario, "duration"), millis)?;
        registry.record_rate(&scenario_metric(&self.scenario, "failed"), failed)?;

        for step in &self.steps {
            match step.status {
                StepStatus::Skipped => {
                    registry.record_counter(&step_metric(&self.scenario, &step.name, "skipped"), 1.0)?;
                }
                status => {
                    registry.record_trend(
                        &step_metric(&self.scenario, &step.name, "duration"),
                        step.duration.as_secs_f64() * 1000.0,
                    )?;
                    registry.record_rate(
                        &step_metric(&self.scenario, &step.name, "failed"),
                        status == StepStatus::Failed,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Declare the built-in series so thresholds on them see an empty metric
/// rather than a missing one.
pub fn declare_builtin_metrics(registry: &MetricsRegistry) -> Result<(), MetricError> {
    registry.declare(ITERATIONS, MetricKind::Counter)?;
    registry.declare(ITERATION_DURATION, MetricKind::Trend)?;
    registry.declare(ITERATION_FAILED, MetricKind::Rate)?;
    registry.declare(ITERATIONS_REJECTED, MetricKind::Counter)?;
    Ok(())
}

pub struct WeightedScenario<F> {
    pub scenario: Arc<dyn Scenario<F>>,
    pub weight: f64,
}

impl<F> Clone for WeightedScenario<F> {
    fn clone(&self) -> Self {
        Self {
            scenario: self.scenario.clone(),
            weight: self.weight,
        }
    }
}

/// Active scenario set with its cumulative-weight table.
pub struct ScenarioSet<F> {
    entries: Vec<WeightedScenario<F>>,
    cumulative: Vec<f64>,
    total: f64,
    last_selectable: usize,
}

impl<F> ScenarioSet<F> {
    /// Build the table. Weights need not sum to 1; a zero weight keeps the
    /// scenario registered but never selected.
    pub fn new(entries: Vec<WeightedScenario<F>>) -> Result<Self, EngineError> {
        let mut cumulative = Vec::with_capacity(entries.len());
        let mut total = 0.0;
        let mut last_selectable = None;
        for (i, entry) in entries.iter().enumerate() {
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(EngineError::Config(format!(
                    "scenario '{}' has invalid weight {}",
                    entry.scenario.name(),
                    entry.weight
                )));
            }
            if entry.weight > 0.0 {
                last_selectable = Some(i);
            }
            total += entry.weight;
            cumulative.push(total);
        }
        let last_selectable = last_selectable.ok_or_else(|| {
            EngineError::Config("at least one scenario needs a positive weight".to_string())
        })?;
        Ok(Self {
            entries,
            cumulative,
            total,
            last_selectable,
        })
    }

    pub fn single(scenario: Arc<dyn Scenario<F>>) -> Result<Self, EngineError> {
        Self::new(vec![WeightedScenario {
            scenario,
            weight: 1.0,
        }])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WeightedScenario<F>] {
        &self.entries
    }

    /// Normalized selection probability of entry `i`.
    pub fn probability(&self, i: usize) -> f64 {
        self.entries[i].weight / self.total
    }

    /// Index selected by a uniform draw in [0, 1).
    pub fn select_index(&self, draw: f64) -> usize {
        let point = draw.clamp(0.0, 1.0) * self.total;
        // First entry whose cumulative weight exceeds the point; zero-weight
        // entries share their predecessor's cumulative value and never match
        let idx = self.cumulative.partition_point(|&c| c <= point);
        idx.min(self.last_selectable)
    }

    pub fn select(&self, draw: f64) -> &Arc<dyn Scenario<F>> {
        &self.entries[self.select_index(draw)].scenario
    }

    /// Pick one scenario with the VU's rng and run it, catching failures
    /// and panics.
    pub fn dispatch(
        &self,
        vu: usize,
        iteration: u64,
        fixture: &F,
        metrics: &MetricsRegistry,
        rng: &mut dyn rand::RngCore,
    ) -> IterationOutcome {
        let draw: f64 = rng.gen();
        let scenario = self.select(draw).clone();
        let mut ctx = IterationContext::new(vu, iteration, fixture, metrics, rng);

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| scenario.run(&mut ctx)))
            .unwrap_or_else(|payload| Err(ScenarioError::Panicked(panic_message(&payload))));
        let duration = started.elapsed();

        let mut steps = ctx.steps;
        let (status, error) = match result {
            Ok(Verdict::Success) => (OutcomeStatus::Success, None),
            Ok(Verdict::Rejected(reason)) => (OutcomeStatus::Rejected, Some(reason)),
            Err(e) => {
                for declared in scenario.steps() {
                    if !steps.iter().any(|s| s.name == *declared) {
                        steps.push(StepRecord {
                            name: declared.to_string(),
                            status: StepStatus::Skipped,
                            duration: Duration::ZERO,
                            error: None,
                        });
                    }
                }
                (OutcomeStatus::Failed, Some(e.to_string()))
            }
        };

        IterationOutcome {
            scenario: scenario.name().to_string(),
            status,
            duration,
            error,
            steps,
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Record an outcome, logging instead of propagating so a metric naming
/// clash never ends a VU.
pub(crate) fn record_outcome(outcome: &IterationOutcome, registry: &MetricsRegistry) {
    if let Err(e) = outcome.record(registry) {
        warn!(scenario = %outcome.scenario, error = %e, "Failed to record iteration outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Named {
        name: &'static str,
    }

    impl Scenario<()> for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, _ctx: &mut IterationContext<'_, ()>) -> Result<Verdict, ScenarioError> {
            Ok(Verdict::Success)
        }
    }

    fn weighted(name: &'static str, weight: f64) -> WeightedScenario<()> {
        WeightedScenario {
            scenario: Arc::new(Named { name }),
            weight,
        }
    }

    /// Login followed by a dependent deposit; `fail_login` breaks the prerequisite.
    struct Deposit {
        fail_login: bool,
        fail_deposit: bool,
    }

    impl Scenario<()> for Deposit {
        fn name(&self) -> &str {
            "deposit"
        }

        fn steps(&self) -> &[&'static str] {
            &["login", "deposit"]
        }

        fn run(&self, ctx: &mut IterationContext<'_, ()>) -> Result<Verdict, ScenarioError> {
            let token = ctx.step("login", |_| {
                if self.fail_login {
                    Err(anyhow!("login status 401"))
                } else {
                    Ok("token".to_string())
                }
            })?;
            ctx.step("deposit", |_| {
                if self.fail_deposit {
                    Err(anyhow!("deposit status 500 with {}", token))
                } else {
                    Ok(())
                }
            })?;
            Ok(Verdict::Success)
        }
    }

    fn run_once(scenario: impl Scenario<()> + 'static) -> IterationOutcome {
        let set = ScenarioSet::single(Arc::new(scenario)).unwrap();
        let registry = MetricsRegistry::default();
        let mut rng = StdRng::seed_from_u64(1);
        set.dispatch(0, 0, &(), &registry, &mut rng)
    }

    struct Checked;

    impl Scenario<()> for Checked {
        fn name(&self) -> &str {
            "checked"
        }

        fn run(&self, ctx: &mut IterationContext<'_, ()>) -> Result<Verdict, ScenarioError> {
            ctx.check("status is 200", true);
            ctx.step("fetch", |c| {
                c.check("response time < 200ms", false);
                Ok(())
            })?;
            Ok(Verdict::Success)
        }
    }

    #[test]
    fn test_checks_feed_rates_without_failing_iteration() {
        let set = ScenarioSet::single(Arc::new(Checked)).unwrap();
        let registry = MetricsRegistry::default();
        let mut rng = StdRng::seed_from_u64(2);
        for i in 0..4 {
            assert!(set.dispatch(0, i, &(), &registry, &mut rng).success());
        }

        let snap = registry.snapshot();
        assert_eq!(snap.rate(CHECKS).unwrap(), 0.5);
        assert_eq!(snap.rate(&check_metric("status is 200")).unwrap(), 1.0);
        assert_eq!(snap.rate(&check_metric("response time < 200ms")).unwrap(), 0.0);
        assert_eq!(snap.rate(ITERATION_FAILED).unwrap(), 0.0);
    }

    #[test]
    fn test_rejects_invalid_weights() {
        assert!(ScenarioSet::new(vec![weighted("a", -0.1)]).is_err());
        assert!(ScenarioSet::new(vec![weighted("a", f64::NAN)]).is_err());
        assert!(ScenarioSet::new(vec![weighted("a", 0.0), weighted("b", 0.0)]).is_err());
        assert!(ScenarioSet::<()>::new(vec![]).is_err());
    }

    #[test]
    fn test_select_edges() {
        let set = ScenarioSet::new(vec![
            weighted("zero-first", 0.0),
            weighted("only", 0.7),
            weighted("zero-last", 0.0),
        ])
        .unwrap();
        for draw in [0.0, 0.25, 0.5, 0.999_999, 1.0] {
            assert_eq!(set.select(draw).name(), "only");
        }
        assert_eq!(set.probability(1), 1.0);
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let set = ScenarioSet::new(vec![
            weighted("login", 0.4),
            weighted("disabled", 0.0),
            weighted("deposit", 0.6),
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20_000 {
            assert_ne!(set.select(rng.gen()).name(), "disabled");
        }
    }

    #[test]
    fn test_frequencies_match_normalized_weights() {
        // Weights deliberately do not sum to 1
        let set = ScenarioSet::new(vec![
            weighted("login", 4.0),
            weighted("deposit", 3.0),
            weighted("transfer", 2.0),
            weighted("balance", 1.0),
        ])
        .unwrap();
        const N: usize = 100_000;
        let mut counts = [0usize; 4];
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..N {
            counts[set.select_index(rng.gen())] += 1;
        }
        for (i, count) in counts.iter().enumerate() {
            let expected = set.probability(i);
            let observed = *count as f64 / N as f64;
            // 5 standard deviations of a binomial proportion
            let tolerance = 5.0 * (expected * (1.0 - expected) / N as f64).sqrt();
            assert!(
                (observed - expected).abs() < tolerance,
                "scenario {}: observed {} expected {}",
                i,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_success_outcome_records_steps() {
        let outcome = run_once(Deposit {
            fail_login: false,
            fail_deposit: false,
        });
        assert!(outcome.success());
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps.iter().all(|s| s.status == StepStatus::Passed));
    }

    #[test]
    fn test_prerequisite_failure_skips_dependent_step() {
        let outcome = run_once(Deposit {
            fail_login: true,
            fail_deposit: false,
        });
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.steps[0].name, "login");
        assert_eq!(outcome.steps[0].status, StepStatus::Failed);
        assert_eq!(outcome.steps[1].name, "deposit");
        assert_eq!(outcome.steps[1].status, StepStatus::Skipped);
        assert!(outcome.error.unwrap().contains("login"));
    }

    #[test]
    fn test_dependent_step_failure_is_distinguishable() {
        let outcome = run_once(Deposit {
            fail_login: false,
            fail_deposit: true,
        });
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.steps[0].status, StepStatus::Passed);
        assert_eq!(outcome.steps[1].status, StepStatus::Failed);

        let registry = MetricsRegistry::default();
        outcome.record(&registry).unwrap();
        let snap = registry.snapshot();
        assert_eq!(snap.rate("step::deposit::login::failed").unwrap(), 0.0);
        assert_eq!(snap.rate("step::deposit::deposit::failed").unwrap(), 1.0);
        assert!(snap.get("step::deposit::deposit::skipped").is_none());
    }

    #[test]
    fn test_skipped_steps_are_counted() {
        let outcome = run_once(Deposit {
            fail_login: true,
            fail_deposit: false,
        });
        let registry = MetricsRegistry::default();
        outcome.record(&registry).unwrap();
        let snap = registry.snapshot();
        assert_eq!(snap.counter_total("step::deposit::deposit::skipped").unwrap(), 1.0);
        assert_eq!(snap.rate("scenario::deposit::failed").unwrap(), 1.0);
        assert_eq!(snap.rate(ITERATION_FAILED).unwrap(), 1.0);
    }

    struct Panics;

    impl Scenario<()> for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn run(&self, _ctx: &mut IterationContext<'_, ()>) -> Result<Verdict, ScenarioError> {
            panic!("boom");
        }
    }

    #[test]
    fn test_panic_is_caught_as_failure() {
        let outcome = run_once(Panics);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("boom"));
    }

    struct InsufficientFunds;

    impl Scenario<()> for InsufficientFunds {
        fn name(&self) -> &str {
            "transfer"
        }

        fn run(&self, _ctx: &mut IterationContext<'_, ()>) -> Result<Verdict, ScenarioError> {
            Ok(Verdict::Rejected("insufficient funds".to_string()))
        }
    }

    #[test]
    fn test_rejection_is_neither_success_nor_failure() {
        let outcome = run_once(InsufficientFunds);
        assert_eq!(outcome.status, OutcomeStatus::Rejected);

        let registry = MetricsRegistry::default();
        declare_builtin_metrics(&registry).unwrap();
        outcome.record(&registry).unwrap();
        let snap = registry.snapshot();
        assert_eq!(snap.rate(ITERATION_FAILED).unwrap(), 0.0);
        assert_eq!(snap.counter_total(ITERATIONS_REJECTED).unwrap(), 1.0);
        assert_eq!(snap.counter_total(ITERATIONS).unwrap(), 1.0);
    }
}
