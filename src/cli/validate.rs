use anyhow::Result;
use std::path::Path;

use crate::cli::config::Config;
use crate::scenarios::check_scenarios;
use crate::utils::format_duration;

/// Validate a run configuration without running it.
/// Checks for:
/// - YAML/JSON syntax
/// - Load profile and duration values
/// - Threshold expressions
/// - Scenario names and weights
pub fn run_validate(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let config = match Config::load(config_path) {
        Ok(config) => {
            println!("  ✓ Config syntax OK");
            config
        }
        Err(e) => {
            println!("  ✗ Config file invalid: {:#}", e);
            return Err(e);
        }
    };

    let plan = match config.to_options() {
        Ok(plan) => plan,
        Err(e) => {
            println!("  ✗ {}", e);
            anyhow::bail!("Config validation failed");
        }
    };
    println!("  ✓ Load profile valid");
    println!(
        "    stages: {} stage(s), {} total, peak {} VUs",
        plan.profile.stages().len(),
        format_duration(plan.profile.total_duration()),
        plan.profile.peak_target()
    );

    if plan.thresholds.is_empty() {
        println!("  ⚠ No thresholds configured (run always passes)");
    } else {
        println!("  ✓ {} threshold(s) parsed", plan.thresholds.len());
        for t in &plan.thresholds {
            println!("    {}", t);
        }
    }

    if let Err(e) = check_scenarios(&plan.scenarios, plan.target.users) {
        println!("  ✗ {}", e);
        anyhow::bail!("Config validation failed");
    }
    println!(
        "  ✓ Scenarios: {}",
        plan.scenarios
            .iter()
            .map(|(name, weight)| format!("{}={}", name, weight))
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const VALID_CONFIG: &str = r#"
stages:
  - duration: 10s
    target: 5
  - duration: 10s
    target: 0
thresholds:
  iteration_duration: ["p(99)<100"]
scenarios:
  health: 1
"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_validate_valid_yaml() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "run.yaml", VALID_CONFIG);
        assert!(run_validate(&path).is_ok());
    }

    #[test]
    fn test_validate_preset_json() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "run.json", r#"{"profile": "load"}"#);
        assert!(run_validate(&path).is_ok());
    }

    #[test]
    fn test_validate_missing_file() {
        assert!(run_validate(Path::new("/nonexistent/run.yaml")).is_err());
    }

    #[test]
    fn test_validate_syntax_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "run.yaml", "stages: [duration: content");
        assert!(run_validate(&path).is_err());
    }

    #[test]
    fn test_validate_bad_threshold() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "run.yaml",
            "profile: smoke\nthresholds:\n  errors: [\"ratio<0.1\"]\n",
        );
        assert!(run_validate(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_stages_without_panicking() {
        let dir = TempDir::new().unwrap();
        let negative = write(&dir, "neg.yaml", "stages:\n  - duration: 10s\n    target: -5\n");
        assert!(run_validate(&negative).is_err());
        let huge = write(&dir, "huge.yaml", "stages: [{duration: 1e300s, target: 5}]\n");
        assert!(run_validate(&huge).is_err());
    }

    #[test]
    fn test_validate_unknown_scenario() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "run.yaml", "profile: smoke\nscenarios:\n  withdraw: 1\n");
        assert!(run_validate(&path).is_err());
    }
}
