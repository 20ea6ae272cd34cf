//! Stage scheduler: elapsed time → target VU count.
//!
//! `target_at` is a pure function of elapsed time over an immutable profile,
//! so any `t` can be sampled independently.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RampMode {
    /// Interpolate from the previous stage's target to this stage's target.
    #[default]
    Linear,
    /// Jump to the stage's target when the stage begins.
    Step,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadProfile {
    stages: Vec<Stage>,
    ramp: RampMode,
    total: Duration,
}

impl LoadProfile {
    pub fn new(stages: Vec<Stage>, ramp: RampMode) -> Result<Self, EngineError> {
        if stages.is_empty() {
            return Err(EngineError::SchedulerConfig(
                "profile needs at least one stage".to_string(),
            ));
        }
        if let Some((i, _)) = stages
            .iter()
            .enumerate()
            .find(|(_, s)| s.duration.is_zero())
        {
            return Err(EngineError::SchedulerConfig(format!(
                "stage {} has a zero duration",
                i + 1
            )));
        }
        let total = stages.iter().map(|s| s.duration).sum();
        Ok(Self {
            stages,
            ramp,
            total,
        })
    }

    /// Linear profile from `(duration, target)` pairs.
    pub fn linear(stages: &[(Duration, usize)]) -> Result<Self, EngineError> {
        Self::new(
            stages.iter().map(|&(d, t)| Stage::new(d, t)).collect(),
            RampMode::Linear,
        )
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn ramp(&self) -> RampMode {
        self.ramp
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn peak_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Real-valued target at `elapsed`; continuous for linear profiles.
    pub fn target_exact(&self, elapsed: Duration) -> f64 {
        let mut stage_start = Duration::ZERO;
        let mut prev_target = 0usize;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                return match self.ramp {
                    RampMode::Step => stage.target as f64,
                    RampMode::Linear => {
                        let progress = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        let diff = stage.target as f64 - prev_target as f64;
                        prev_target as f64 + diff * progress
                    }
                };
            }
            stage_start = stage_end;
            prev_target = stage.target;
        }
        // Past the end the last target holds (0 for a ramp-down profile)
        prev_target as f64
    }

    /// Target VU count at `elapsed`, rounded to the nearest integer.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        self.target_exact(elapsed).round().max(0.0) as usize
    }

    /// Profile end and stage boundaries, offsets from the run start.
    pub fn boundaries(&self) -> Vec<Duration> {
        self.stages
            .iter()
            .scan(Duration::ZERO, |at, s| {
                *at += s.duration;
                Some(*at)
            })
            .collect()
    }
}
