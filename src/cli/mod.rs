pub mod config;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use config::{Config, Preset};

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Staged load generator with weighted scenarios and pass/fail thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test
    Run {
        /// Path to the configuration file (YAML/JSON); presets alone need none
        config: Option<PathBuf>,

        /// Use a built-in load shape
        #[arg(short, long, value_enum)]
        profile: Option<Preset>,

        /// Target service URL
        #[arg(long, env = "BASE_URL")]
        base_url: Option<String>,

        /// Hard wall-clock limit for the load phase (e.g. "5m")
        #[arg(long)]
        timeout: Option<String>,

        /// Print the summary as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export final summary to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,

        /// Read control commands (ramp N, follow, status, stop) from stdin
        #[arg(short, long)]
        interactive: bool,
    },
    /// Validate a configuration file without running it
    Validate {
        config: PathBuf,
    },
    /// Print the JSON Schema of the configuration file
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Apply command-line overrides on top of a loaded (or empty) config.
pub fn merge_overrides(
    mut config: Config,
    profile: Option<Preset>,
    base_url: Option<String>,
    timeout: Option<String>,
) -> Config {
    if profile.is_some() {
        config.profile = profile;
    }
    if base_url.is_some() {
        config.base_url = base_url;
    }
    if timeout.is_some() {
        config.timeout = timeout;
    }
    config
}
