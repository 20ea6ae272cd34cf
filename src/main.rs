use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use volley::cli::config::{Config, Preset};
use volley::cli::{merge_overrides, Cli, Commands};
use volley::engine::control::parse_control_command;
use volley::engine::Engine;
use volley::error::EngineError;
use volley::scenarios::wallet_suite;
use volley::stats::report::EXIT_INVALID_CONFIG;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Spawn a thread turning stdin lines into control commands.
fn spawn_stdin_commands() -> crossbeam_channel::Receiver<volley::engine::control::ControlCommand> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_control_command(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(input = %line.trim(), "Unknown command (try: ramp N, follow, status, stop)"),
            }
        }
    });
    rx
}

fn invalid_config(e: impl std::fmt::Display) -> ! {
    let message = format!("{:#}", e);
    error!(error = %message, "Invalid configuration");
    eprintln!("Error: {}", message);
    std::process::exit(EXIT_INVALID_CONFIG);
}

#[allow(clippy::too_many_arguments)]
fn run(
    config_path: Option<PathBuf>,
    profile: Option<Preset>,
    base_url: Option<String>,
    timeout: Option<String>,
    json: bool,
    export_json: Option<PathBuf>,
    interactive: bool,
) -> Result<()> {
    let config = match &config_path {
        Some(path) => Config::load(path).unwrap_or_else(|e| invalid_config(e)),
        None => Config::default(),
    };
    let config = merge_overrides(config, profile, base_url, timeout);
    let plan = config
        .to_options()
        .unwrap_or_else(|e: EngineError| invalid_config(e));
    let (scenarios, setup) = wallet_suite(&plan.scenarios, &plan.target)
        .unwrap_or_else(|e: EngineError| invalid_config(e));

    info!(
        base_url = %plan.target.base_url,
        scenarios = plan.scenarios.len(),
        thresholds = plan.thresholds.len(),
        "Configured run"
    );

    let mut engine = Engine::new(plan.profile, scenarios, setup, plan.options)
        .with_thresholds(plan.thresholds);
    if interactive {
        println!("Interactive control: ramp N | follow | status | stop");
        engine = engine.with_commands(spawn_stdin_commands());
    }

    let control = engine.control();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping (Ctrl-C)...");
        control.stop();
    })?;

    let report = engine.run();

    if json {
        println!("{}", report.to_json());
    } else {
        report.report();
    }
    if let Some(path) = export_json {
        std::fs::write(&path, report.to_json())?;
        info!(path = %path.display(), "Summary exported");
    }

    std::process::exit(report.exit_code());
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            profile,
            base_url,
            timeout,
            json,
            export_json,
            interactive,
        } => run(config, profile, base_url, timeout, json, export_json, interactive),
        Commands::Validate { config } => {
            if volley::cli::validate::run_validate(&config).is_err() {
                std::process::exit(EXIT_INVALID_CONFIG);
            }
            Ok(())
        }
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "volley", &mut std::io::stdout());
            Ok(())
        }
    }
}
