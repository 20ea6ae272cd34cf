use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Commands that can be sent to control a running load test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Pin the VU target, overriding the stage schedule
    Ramp(usize),
    /// Drop a ramp override and follow the schedule again
    Follow,
    /// Log current status
    Status,
    /// Stop the run (external abort)
    Stop,
}

/// Shared state between the run controller, the pool and VU workers.
///
/// `target_workers` is written only by the scheduler's polling routine and
/// read by the pool; `live_workers` counts VU threads that have not exited.
pub struct ControlState {
    target_workers: AtomicUsize,
    live_workers: AtomicUsize,
    peak_workers: AtomicUsize,
    /// `usize::MAX` when following the schedule
    override_target: AtomicUsize,
    stopped: AtomicBool,
    // Never sent on; dropping the sender wakes every receiver at once
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl ControlState {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        Self {
            target_workers: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            peak_workers: AtomicUsize::new(0),
            override_target: AtomicUsize::new(usize::MAX),
            stopped: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    pub fn set_target_workers(&self, count: usize) {
        self.target_workers.store(count, Ordering::SeqCst);
    }

    pub fn target_workers(&self) -> usize {
        self.target_workers.load(Ordering::SeqCst)
    }

    pub fn set_override(&self, target: Option<usize>) {
        self.override_target
            .store(target.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    pub fn override_target(&self) -> Option<usize> {
        match self.override_target.load(Ordering::SeqCst) {
            usize::MAX => None,
            n => Some(n),
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    pub fn peak_workers(&self) -> usize {
        self.peak_workers.load(Ordering::SeqCst)
    }

    /// Mark a VU as live until the returned guard drops.
    pub(crate) fn enter_worker(&self) -> LiveGuard<'_> {
        let live = self.live_workers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_workers.fetch_max(live, Ordering::SeqCst);
        LiveGuard { state: self }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_tx.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Disconnects when `stop` is called; usable in `select!`.
    pub fn stop_signal(&self) -> &Receiver<()> {
        &self.stop_rx
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct LiveGuard<'a> {
    state: &'a ControlState,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.state.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Parse a control command from user input
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let input = input.trim();
    let parts: Vec<&str> = input.split_whitespace().collect();

    if parts.is_empty() {
        return None;
    }

    match parts[0].to_lowercase().as_str() {
        "ramp" | "scale" => parts
            .get(1)?
            .parse::<usize>()
            .ok()
            .map(ControlCommand::Ramp),
        "follow" | "schedule" => Some(ControlCommand::Follow),
        "status" | "stats" => Some(ControlCommand::Status),
        "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
        _ => None,
    }
}
