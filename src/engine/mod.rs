//! Run controller: drives one load test through
//! `Idle → Setup → Running → TearingDown → Evaluated → {Passed | Failed}`.

pub mod control;
pub mod dispatch;
pub mod memory;
pub mod pool;
pub mod schedule;

use chrono::Utc;
use crossbeam_channel::{select, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{SetupError, TeardownError};
use crate::stats::report::{AbortCause, PhaseMark, RunEnd, RunPhase, RunReport, Verdict};
use crate::stats::threshold::{all_passed, evaluate_all, Threshold};
use crate::stats::trend::TrendConfig;
use crate::stats::{MetricsRegistry, ITERATIONS};

use control::{ControlCommand, ControlState};
use dispatch::{declare_builtin_metrics, ScenarioSet};
use pool::{PoolConfig, VuPool};
use schedule::LoadProfile;

/// Setup and teardown hooks, each invoked once per run without concurrency.
///
/// The value returned by `setup` is shared read-only with every VU.
pub trait Lifecycle<F>: Send + Sync {
    fn setup(&self) -> anyhow::Result<F>;

    fn teardown(&self, _fixture: &F) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifecycle for scenarios that need no shared fixture.
pub struct NoFixture;

impl Lifecycle<()> for NoFixture {
    fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How often the scheduler recomputes the VU target.
    pub poll_interval: Duration,
    /// How long in-flight iterations may run after Running ends before the
    /// drain warns about them. The drain still waits for every VU.
    pub graceful_stop: Duration,
    /// Wall-clock limit for Running; defaults to the profile length plus
    /// `graceful_stop`.
    pub timeout: Option<Duration>,
    pub lenient_thresholds: bool,
    pub trend: TrendConfig,
    pub pool: PoolConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            graceful_stop: Duration::from_secs(30),
            timeout: None,
            lenient_thresholds: false,
            trend: TrendConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

struct Timeline {
    clock: Instant,
    marks: Vec<PhaseMark>,
}

impl Timeline {
    fn new() -> Self {
        Self {
            clock: Instant::now(),
            marks: Vec::new(),
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(%phase, "Entering phase");
        self.marks.push(PhaseMark {
            phase,
            at_ms: self.clock.elapsed().as_millis() as u64,
        });
    }
}

pub struct Engine<F> {
    profile: LoadProfile,
    scenarios: Arc<ScenarioSet<F>>,
    lifecycle: Box<dyn Lifecycle<F>>,
    thresholds: Vec<Threshold>,
    options: RunOptions,
    control: Arc<ControlState>,
    registry: Arc<MetricsRegistry>,
    commands: Option<Receiver<ControlCommand>>,
}

impl<F: Send + Sync + 'static> Engine<F> {
    pub fn new(
        profile: LoadProfile,
        scenarios: ScenarioSet<F>,
        lifecycle: impl Lifecycle<F> + 'static,
        options: RunOptions,
    ) -> Self {
        let registry = Arc::new(MetricsRegistry::new(options.trend));
        Self {
            profile,
            scenarios: Arc::new(scenarios),
            lifecycle: Box::new(lifecycle),
            thresholds: Vec::new(),
            options,
            control: Arc::new(ControlState::new()),
            registry,
            commands: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Vec<Threshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Accept run-time commands (ramp override, status, stop).
    pub fn with_commands(mut self, commands: Receiver<ControlCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Handle for stopping the run from another thread (e.g. a signal handler).
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    pub fn registry(&self) -> Arc<MetricsRegistry> {
        self.registry.clone()
    }

    /// Run to completion. Always returns a report, including for aborted
    /// runs, with thresholds evaluated over whatever was collected.
    pub fn run(self) -> RunReport {
        let started_at = Utc::now();
        let mut timeline = Timeline::new();
        timeline.enter(RunPhase::Idle);

        if let Err(e) = declare_builtin_metrics(&self.registry) {
            warn!(error = %e, "Could not declare built-in metrics");
        }

        timeline.enter(RunPhase::Setup);
        let end = match self.lifecycle.setup() {
            Err(e) => {
                let err = SetupError(e);
                error!(error = %err, "Setup failed, skipping load");
                RunEnd::Aborted {
                    cause: AbortCause::Setup,
                    message: err.to_string(),
                }
            }
            Ok(fixture) => {
                let fixture = Arc::new(fixture);
                timeline.enter(RunPhase::Running);
                info!(
                    stages = self.profile.stages().len(),
                    duration = %crate::utils::format_duration(self.profile.total_duration()),
                    peak = self.profile.peak_target(),
                    "Starting load"
                );
                let end = self.drive(fixture.clone());

                timeline.enter(RunPhase::TearingDown);
                if let Err(e) = self.lifecycle.teardown(&fixture) {
                    warn!(error = %TeardownError(e), "Teardown failed");
                }
                end
            }
        };

        let snapshot = self.registry.snapshot();
        let thresholds = evaluate_all(
            &self.thresholds,
            &snapshot,
            self.options.lenient_thresholds,
        );
        timeline.enter(RunPhase::Evaluated);

        let aborted = matches!(end, RunEnd::Aborted { .. });
        let verdict = if !aborted && all_passed(&thresholds) {
            timeline.enter(RunPhase::Passed);
            Verdict::Passed
        } else {
            timeline.enter(RunPhase::Failed);
            Verdict::Failed
        };
        info!(?verdict, "Run finished");

        RunReport {
            started_at,
            elapsed_ms: timeline.clock.elapsed().as_millis() as u64,
            verdict,
            end,
            phases: timeline.marks,
            peak_vus: self.control.peak_workers(),
            metrics: snapshot.summaries(),
            thresholds,
            snapshot,
        }
    }

    /// The Running phase: poll the schedule and reconcile the pool until the
    /// schedule ends, the run times out, or it is stopped.
    fn drive(&self, fixture: Arc<F>) -> RunEnd {
        let mut pool = VuPool::new(
            self.scenarios.clone(),
            fixture,
            self.registry.clone(),
            self.control.clone(),
            self.options.pool.clone(),
        );

        let total = self.profile.total_duration();
        let limit = self
            .options
            .timeout
            .unwrap_or(total + self.options.graceful_stop);
        let start = Instant::now();
        let schedule_end = crossbeam_channel::after(total);
        let deadline = crossbeam_channel::after(limit);
        let ticker = crossbeam_channel::tick(self.options.poll_interval);
        let idle = crossbeam_channel::never();
        let mut commands_open = self.commands.is_some();

        let end = loop {
            let elapsed = start.elapsed();
            let target = self
                .control
                .override_target()
                .unwrap_or_else(|| self.profile.target_at(elapsed));
            self.control.set_target_workers(target);
            if let Err(e) = pool.reconcile(target) {
                error!(error = %e, "VU pool failed, aborting");
                break RunEnd::Aborted {
                    cause: AbortCause::PoolResource,
                    message: e.to_string(),
                };
            }

            let commands = match (&self.commands, commands_open) {
                (Some(rx), true) => rx,
                _ => &idle,
            };
            select! {
                recv(ticker) -> _ => {}
                recv(schedule_end) -> _ => break RunEnd::Completed,
                recv(deadline) -> _ => {
                    warn!(limit = %crate::utils::format_duration(limit), "Run timeout reached");
                    break RunEnd::TimedOut;
                }
                recv(self.control.stop_signal()) -> _ => break RunEnd::Aborted {
                    cause: AbortCause::External,
                    message: "stopped by operator".to_string(),
                },
                recv(commands) -> cmd => match cmd {
                    Ok(cmd) => self.apply(cmd, elapsed),
                    Err(_) => commands_open = false,
                },
            }
        };

        info!(live = self.control.live_workers(), "Draining VUs");
        let overdue = pool.shutdown(self.options.graceful_stop);
        info!(overdue, "All VUs exited");
        end
    }

    fn apply(&self, command: ControlCommand, elapsed: Duration) {
        match command {
            ControlCommand::Ramp(n) => {
                info!(vus = n, "Manual ramp override");
                self.control.set_override(Some(n));
            }
            ControlCommand::Follow => {
                info!("Following the stage schedule");
                self.control.set_override(None);
            }
            ControlCommand::Status => {
                let iterations = self
                    .registry
                    .snapshot()
                    .counter_total(ITERATIONS)
                    .unwrap_or(0.0);
                info!(
                    elapsed = %crate::utils::format_duration(elapsed),
                    target_vus = self.control.target_workers(),
                    live = self.control.live_workers(),
                    peak = self.control.peak_workers(),
                    iterations,
                    "Status"
                );
            }
            ControlCommand::Stop => {
                info!("Stop requested");
                self.control.stop();
            }
        }
    }
}
