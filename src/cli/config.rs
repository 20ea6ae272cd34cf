use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::engine::pool::{Pacing, PoolConfig};
use crate::engine::schedule::{LoadProfile, RampMode, Stage};
use crate::engine::RunOptions;
use crate::error::EngineError;
use crate::stats::threshold::{parse_thresholds, Threshold};
use crate::stats::trend::{TrendConfig, TrendStorage, DEFAULT_RESERVOIR_CAPACITY};
use crate::utils::parse_duration_str;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StageConfig {
    /// Stage length (e.g. "30s", "1m", "4h")
    pub duration: String,
    /// VU count reached at the end of the stage; must not be negative
    pub target: i64,
}

impl StageConfig {
    fn new(duration: &str, target: i64) -> Self {
        Self {
            duration: duration.to_string(),
            target,
        }
    }
}

/// Built-in load shapes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Ramp to 100 VUs over the wallet API, with default thresholds
    Load,
    /// Two sudden jumps to 1000 VUs against the health endpoint
    Spike,
    /// Climb to 500 VUs, then a long recovery
    Stress,
    /// 100 VUs held for four hours
    Soak,
    /// One VU, quick sanity check
    Smoke,
}

impl Preset {
    pub fn stages(self) -> Vec<StageConfig> {
        let s = StageConfig::new;
        match self {
            Preset::Load => vec![s("30s", 10), s("1m", 50), s("2m", 100), s("1m", 50), s("30s", 0)],
            Preset::Spike => vec![
                s("10s", 10),
                s("1m", 1000),
                s("10s", 10),
                s("10s", 10),
                s("1m", 1000),
                s("10s", 10),
            ],
            Preset::Stress => vec![
                s("2m", 100),
                s("5m", 200),
                s("2m", 300),
                s("2m", 400),
                s("2m", 500),
                s("10m", 0),
            ],
            Preset::Soak => vec![s("5m", 100), s("4h", 100), s("5m", 0)],
            Preset::Smoke => vec![s("5s", 1), s("20s", 1), s("5s", 0)],
        }
    }

    pub fn thresholds(self) -> BTreeMap<String, Vec<String>> {
        let mut thresholds = BTreeMap::new();
        if self == Preset::Load {
            thresholds.insert(
                "http_req_duration".to_string(),
                vec!["p(95)<500".to_string(), "p(99)<1000".to_string()],
            );
            thresholds.insert("errors".to_string(), vec!["rate<0.1".to_string()]);
            thresholds.insert("http_req_failed".to_string(), vec!["rate<0.05".to_string()]);
        }
        thresholds
    }

    pub fn scenarios(self) -> BTreeMap<String, f64> {
        let pairs: &[(&str, f64)] = match self {
            Preset::Load | Preset::Smoke => &[
                ("login", 0.4),
                ("deposit", 0.3),
                ("transfer", 0.2),
                ("balance", 0.1),
            ],
            Preset::Spike => &[("probes", 1.0)],
            Preset::Stress | Preset::Soak => &[("health", 1.0)],
        };
        pairs.iter().map(|(n, w)| (n.to_string(), *w)).collect()
    }

    pub fn pause(self) -> &'static str {
        match self {
            Preset::Load | Preset::Smoke => "1s",
            Preset::Spike => "100ms",
            Preset::Stress => "500ms",
            Preset::Soak => "0ms",
        }
    }

    /// Latency checked on every health request.
    pub fn max_latency(self) -> Option<&'static str> {
        match self {
            Preset::Stress => Some("200ms"),
            _ => None,
        }
    }

    /// Accounts to provision during setup.
    pub fn users(self) -> usize {
        match self {
            Preset::Load | Preset::Smoke => 5,
            _ => 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Named preset; explicit fields below override its values
    #[serde(alias = "preset")]
    pub profile: Option<Preset>,
    /// Ramping schedule (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Option<Vec<StageConfig>>,
    /// "linear" (default) or "step"
    pub ramp: Option<RampMode>,
    /// Pass/fail criteria: metric name to expressions such as "p(95)<500"
    #[serde(alias = "criteria")]
    pub thresholds: Option<BTreeMap<String, Vec<String>>>,
    /// Pass thresholds whose metric was never observed
    #[serde(alias = "lenientThresholds")]
    pub lenient_thresholds: Option<bool>,
    /// Scenario name to selection weight
    pub scenarios: Option<BTreeMap<String, f64>>,
    /// Think time between iterations (e.g. "1s")
    pub pause: Option<String>,
    /// Random extra think time on top of `pause` (e.g. "500ms")
    pub jitter: Option<String>,
    /// How often the schedule is re-evaluated (default "1s")
    #[serde(alias = "pollInterval")]
    pub poll_interval: Option<String>,
    /// Graceful shutdown wait time (default "30s")
    pub stop: Option<String>,
    /// Hard wall-clock limit for the load phase
    pub timeout: Option<String>,
    /// Refuse to run more VUs than this
    #[serde(alias = "maxVus")]
    pub max_vus: Option<usize>,
    /// VU thread stack size in bytes
    #[serde(alias = "stackSize")]
    pub stack_size: Option<usize>,
    /// Hold back scale-up at 85% memory usage and abort at 95%
    #[serde(alias = "memorySafe")]
    pub memory_safe: Option<bool>,
    /// "exact" (bounded reservoir) or "histogram" (HDR, constant memory)
    #[serde(alias = "trendStorage")]
    pub trend_storage: Option<TrendStorage>,
    /// Samples kept per trend before reservoir sampling starts
    #[serde(alias = "reservoirCapacity")]
    pub reservoir_capacity: Option<usize>,
    /// Target service (default http://localhost:8080)
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Test accounts created during setup
    pub users: Option<usize>,
    /// Per-request timeout (default "10s")
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// Health requests check `response time < max_latency` (stress preset: "200ms")
    #[serde(alias = "maxLatency")]
    pub max_latency: Option<String>,
}

/// Settings for the wallet scenarios and their setup.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub base_url: String,
    pub users: usize,
    pub request_timeout: Duration,
    pub max_latency: Option<Duration>,
}

/// Everything needed to build and start an engine.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub profile: LoadProfile,
    pub options: RunOptions,
    pub thresholds: Vec<Threshold>,
    pub scenarios: BTreeMap<String, f64>,
    pub target: TargetConfig,
}

fn duration_field(name: &str, value: Option<&str>, default: &str) -> Result<Duration, EngineError> {
    let raw = value.unwrap_or(default);
    parse_duration_str(raw)
        .ok_or_else(|| EngineError::Config(format!("{}: invalid duration '{}'", name, raw)))
}

impl Config {
    /// Load from a YAML or JSON file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content, path.extension().and_then(|e| e.to_str()))
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str, extension: Option<&str>) -> Result<Self> {
        let config = match extension {
            Some("json") => serde_json::from_str(content)?,
            _ => serde_yaml::from_str(content)?,
        };
        Ok(config)
    }

    pub fn stages(&self) -> Option<Vec<StageConfig>> {
        self.stages
            .clone()
            .or_else(|| self.profile.map(Preset::stages))
    }

    pub fn thresholds(&self) -> BTreeMap<String, Vec<String>> {
        self.thresholds
            .clone()
            .or_else(|| self.profile.map(Preset::thresholds))
            .unwrap_or_default()
    }

    pub fn scenarios(&self) -> BTreeMap<String, f64> {
        self.scenarios
            .clone()
            .unwrap_or_else(|| self.profile.unwrap_or(Preset::Load).scenarios())
    }

    /// Validate and convert into typed run settings.
    pub fn to_options(&self) -> Result<RunPlan, EngineError> {
        let stages = self.stages().ok_or_else(|| {
            EngineError::SchedulerConfig("no stages configured and no profile selected".to_string())
        })?;
        let stages = stages
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let target = usize::try_from(s.target).map_err(|_| {
                    EngineError::SchedulerConfig(format!(
                        "stage {}: target {} is negative",
                        i + 1,
                        s.target
                    ))
                })?;
                parse_duration_str(&s.duration)
                    .map(|d| Stage::new(d, target))
                    .ok_or_else(|| {
                        EngineError::SchedulerConfig(format!(
                            "stage {}: invalid duration '{}'",
                            i + 1,
                            s.duration
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let profile = LoadProfile::new(stages, self.ramp.unwrap_or_default())?;

        let preset = self.profile;
        let pause = duration_field(
            "pause",
            self.pause.as_deref(),
            preset.map(Preset::pause).unwrap_or("1s"),
        )?;
        let jitter = duration_field("jitter", self.jitter.as_deref(), "0ms")?;
        let pacing = if jitter.is_zero() {
            Pacing::Fixed { delay: pause }
        } else {
            Pacing::Jittered {
                min: pause,
                max: pause + jitter,
            }
        };

        let poll_interval = duration_field("poll_interval", self.poll_interval.as_deref(), "1s")?;
        if poll_interval.is_zero() {
            return Err(EngineError::Config("poll_interval must be positive".to_string()));
        }
        let timeout = match self.timeout.as_deref() {
            Some(raw) => Some(duration_field("timeout", Some(raw), "")?),
            None => None,
        };

        let capacity = self.reservoir_capacity.unwrap_or(DEFAULT_RESERVOIR_CAPACITY);
        if capacity == 0 {
            return Err(EngineError::Config("reservoir_capacity must be positive".to_string()));
        }

        let options = RunOptions {
            poll_interval,
            graceful_stop: duration_field("stop", self.stop.as_deref(), "30s")?,
            timeout,
            lenient_thresholds: self.lenient_thresholds.unwrap_or(false),
            trend: TrendConfig {
                storage: self.trend_storage.unwrap_or_default(),
                reservoir_capacity: capacity,
            },
            pool: PoolConfig {
                pacing,
                max_vus: self.max_vus,
                stack_size: self.stack_size,
                memory_safe: self.memory_safe.unwrap_or(false),
            },
        };

        let thresholds = parse_thresholds(&self.thresholds())?;

        let max_latency = match self
            .max_latency
            .as_deref()
            .or_else(|| preset.and_then(Preset::max_latency))
        {
            Some(raw) => Some(duration_field("max_latency", Some(raw), "")?),
            None => None,
        };

        let target = TargetConfig {
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            users: self
                .users
                .unwrap_or_else(|| preset.map(Preset::users).unwrap_or(5)),
            request_timeout: duration_field(
                "request_timeout",
                self.request_timeout.as_deref(),
                "10s",
            )?,
            max_latency,
        };

        Ok(RunPlan {
            profile,
            options,
            thresholds,
            scenarios: self.scenarios(),
            target,
        })
    }
}
