pub mod cli;
pub mod engine;
pub mod error;
pub mod scenarios;
pub mod stats;
pub mod utils;

pub use engine::{Engine, Lifecycle, NoFixture, RunOptions};
pub use error::{EngineError, ScenarioError};
pub use stats::report::RunReport;
pub use stats::MetricsRegistry;
pub use utils::parse_duration_str;
