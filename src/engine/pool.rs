//! VU pool: one OS thread per virtual user, grown and shrunk toward the
//! scheduler's target.
//!
//! Retirement is cooperative. A worker finishes its in-flight iteration and
//! then exits; nothing is interrupted mid-request.

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::control::ControlState;
use super::dispatch::{record_outcome, ScenarioSet};
use super::memory::{classify, format_bytes, MemoryProbe, Pressure, SystemProbe, PER_VU_BYTES};
use crate::error::EngineError;
use crate::stats::MetricsRegistry;

/// Think time between a VU's iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Pacing {
    Fixed {
        #[serde(with = "millis")]
        #[schemars(with = "u64")]
        delay: Duration,
    },
    /// Uniform in `[min, max]`.
    Jittered {
        #[serde(with = "millis")]
        #[schemars(with = "u64")]
        min: Duration,
        #[serde(with = "millis")]
        #[schemars(with = "u64")]
        max: Duration,
    },
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Fixed {
            delay: Duration::from_secs(1),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Pacing::Fixed {
            delay: Duration::ZERO,
        }
    }

    pub fn delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            Pacing::Fixed { delay } => delay,
            Pacing::Jittered { min, max } if max > min => {
                let ms = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
                Duration::from_millis(ms)
            }
            Pacing::Jittered { min, .. } => min,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub pacing: Pacing,
    pub max_vus: Option<usize>,
    pub stack_size: Option<usize>,
    /// Consult host memory before growing.
    pub memory_safe: bool,
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    started: AtomicU64,
    completed: AtomicU64,
}

impl PoolCounters {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

struct Worker {
    id: usize,
    retire: Sender<()>,
    handle: JoinHandle<()>,
}

struct WorkerContext<F> {
    scenarios: Arc<ScenarioSet<F>>,
    fixture: Arc<F>,
    registry: Arc<MetricsRegistry>,
    control: Arc<ControlState>,
    counters: Arc<PoolCounters>,
    pacing: Pacing,
}

pub struct VuPool<F> {
    scenarios: Arc<ScenarioSet<F>>,
    fixture: Arc<F>,
    registry: Arc<MetricsRegistry>,
    control: Arc<ControlState>,
    config: PoolConfig,
    probe: Box<dyn MemoryProbe>,
    counters: Arc<PoolCounters>,
    active: Vec<Worker>,
    retired: Vec<JoinHandle<()>>,
    next_id: usize,
}

impl<F: Send + Sync + 'static> VuPool<F> {
    pub fn new(
        scenarios: Arc<ScenarioSet<F>>,
        fixture: Arc<F>,
        registry: Arc<MetricsRegistry>,
        control: Arc<ControlState>,
        config: PoolConfig,
    ) -> Self {
        Self {
            scenarios,
            fixture,
            registry,
            control,
            config,
            probe: Box::new(SystemProbe),
            counters: Arc::new(PoolCounters::default()),
            active: Vec::new(),
            retired: Vec::new(),
            next_id: 0,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Workers not yet told to retire.
    pub fn active(&self) -> usize {
        self.active.len()
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    /// Move the pool toward `target` VUs. Returns the active count.
    ///
    /// Growth spawns workers immediately; shrinkage retires the newest
    /// workers, which exit after their current iteration.
    pub fn reconcile(&mut self, target: usize) -> Result<usize, EngineError> {
        self.reap();
        let current = self.active.len();

        if target > current {
            if let Some(max) = self.config.max_vus {
                if target > max {
                    return Err(EngineError::PoolResource {
                        target,
                        reason: format!("exceeds max_vus {}", max),
                    });
                }
            }
            let reachable = if self.config.memory_safe {
                self.memory_ceiling(current, target)?
            } else {
                target
            };
            for _ in current..reachable {
                self.spawn_worker(target)?;
            }
            if reachable > current {
                debug!(from = current, to = reachable, "Scaled up");
            }
        } else if target < current {
            while self.active.len() > target {
                if let Some(worker) = self.active.pop() {
                    // Dropping the sender disconnects the worker's retire channel
                    drop(worker.retire);
                    self.retired.push(worker.handle);
                }
            }
            debug!(from = current, to = target, "Scaled down");
        }
        Ok(self.active.len())
    }

    /// Highest VU count host memory allows this tick, at most `target`.
    fn memory_ceiling(&self, current: usize, target: usize) -> Result<usize, EngineError> {
        let info = self.probe.read();
        match classify(&info) {
            Pressure::Normal => {
                let ceiling = current.saturating_add(info.headroom_vus(PER_VU_BYTES));
                if ceiling < target {
                    warn!(
                        available = %format_bytes(info.available_bytes),
                        target_vus = target,
                        ceiling,
                        "Not enough free memory for every VU, growing partially"
                    );
                }
                Ok(ceiling.min(target))
            }
            Pressure::High(usage) => {
                warn!(
                    usage = %format!("{:.0}%", usage * 100.0),
                    available = %format_bytes(info.available_bytes),
                    target_vus = target,
                    "Memory pressure high, holding VU count"
                );
                Ok(current)
            }
            Pressure::Critical(usage) => Err(EngineError::PoolResource {
                target,
                reason: format!("memory usage at {:.0}%", usage * 100.0),
            }),
        }
    }

    fn spawn_worker(&mut self, target: usize) -> Result<(), EngineError> {
        let id = self.next_id;
        let (retire_tx, retire_rx) = crossbeam_channel::bounded::<()>(0);
        let ctx = WorkerContext {
            scenarios: self.scenarios.clone(),
            fixture: self.fixture.clone(),
            registry: self.registry.clone(),
            control: self.control.clone(),
            counters: self.counters.clone(),
            pacing: self.config.pacing,
        };

        let mut builder = thread::Builder::new().name(format!("vu-{}", id));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder
            .spawn(move || worker_loop(id, ctx, retire_rx))
            .map_err(|e| EngineError::PoolResource {
                target,
                reason: format!("failed to spawn VU thread: {}", e),
            })?;

        self.next_id += 1;
        self.active.push(Worker {
            id,
            retire: retire_tx,
            handle,
        });
        Ok(())
    }

    /// Join retired workers that have already exited.
    pub fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(|h| h.is_finished());
        for handle in done {
            if handle.join().is_err() {
                warn!("VU thread panicked outside an iteration");
            }
        }
        self.retired = pending;
    }

    /// Retire every worker and block until all of them have exited.
    ///
    /// Workers still inside an iteration after `grace` are reported with a
    /// warning and then waited for; their iterations are bounded by the
    /// scenario's own request timeouts. Returns how many outlived the grace.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        self.retire_all();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            self.reap();
            if self.retired.is_empty() {
                return 0;
            }
            thread::sleep(Duration::from_millis(10));
        }

        self.reap();
        let overdue = self.retired.len();
        if overdue > 0 {
            warn!(
                overdue,
                grace = %crate::utils::format_duration(grace),
                "VUs still running after graceful stop, waiting for their iterations"
            );
        }
        self.join_retired();
        overdue
    }

    fn retire_all(&mut self) {
        for worker in self.active.drain(..) {
            debug!(vu = worker.id, "Retiring");
            drop(worker.retire);
            self.retired.push(worker.handle);
        }
    }

    fn join_retired(&mut self) {
        for handle in self.retired.drain(..) {
            if handle.join().is_err() {
                warn!("VU thread panicked outside an iteration");
            }
        }
    }
}

impl<F> Drop for VuPool<F> {
    fn drop(&mut self) {
        for worker in self.active.drain(..) {
            drop(worker.retire);
            self.retired.push(worker.handle);
        }
        for handle in self.retired.drain(..) {
            let _ = handle.join();
        }
    }
}

fn retired(retire: &Receiver<()>) -> bool {
    !matches!(retire.try_recv(), Err(TryRecvError::Empty))
}

fn worker_loop<F>(id: usize, ctx: WorkerContext<F>, retire: Receiver<()>) {
    let _live = ctx.control.enter_worker();
    let mut rng = StdRng::from_entropy();
    let mut iteration = 0u64;

    loop {
        if ctx.control.is_stopped() || retired(&retire) {
            break;
        }

        ctx.counters.started.fetch_add(1, Ordering::SeqCst);
        let outcome = ctx
            .scenarios
            .dispatch(id, iteration, &ctx.fixture, &ctx.registry, &mut rng);
        record_outcome(&outcome, &ctx.registry);
        ctx.counters.completed.fetch_add(1, Ordering::SeqCst);
        iteration += 1;

        let delay = ctx.pacing.delay(&mut rng);
        if delay.is_zero() {
            continue;
        }
        select! {
            recv(ctx.control.stop_signal()) -> _ => break,
            recv(retire) -> _ => break,
            default(delay) => {}
        }
    }
    debug!(vu = id, iterations = iteration, "VU exited");
}
