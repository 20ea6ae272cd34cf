pub mod wallet;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::TargetConfig;
use crate::engine::dispatch::{Scenario, ScenarioSet, WeightedScenario};
use crate::error::EngineError;
use wallet::{Balance, Deposit, Health, Login, Transfer, WalletApi, WalletFixture, WalletSetup};

/// Scenario names accepted in configuration.
pub const KNOWN_SCENARIOS: &[&str] = &["login", "deposit", "transfer", "balance", "health", "probes"];

/// Scenarios that log in with a provisioned account.
const NEEDS_USERS: &[&str] = &["login", "deposit", "transfer", "balance"];

fn build(
    name: &str,
    api: &WalletApi,
    max_latency: Option<Duration>,
) -> Option<Arc<dyn Scenario<WalletFixture>>> {
    let api = api.clone();
    let scenario: Arc<dyn Scenario<WalletFixture>> = match name {
        "login" => Arc::new(Login { api }),
        "deposit" => Arc::new(Deposit { api }),
        "transfer" => Arc::new(Transfer { api }),
        "balance" => Arc::new(Balance { api }),
        "health" => Arc::new(Health {
            api,
            name: "health",
            endpoints: &["/health"],
            max_latency,
        }),
        "probes" => Arc::new(Health {
            api,
            name: "probes",
            endpoints: &["/health", "/ready", "/alive"],
            max_latency,
        }),
        _ => return None,
    };
    Some(scenario)
}

/// Check scenario names and weights without building anything.
pub fn check_scenarios(weights: &BTreeMap<String, f64>, users: usize) -> Result<(), EngineError> {
    for (name, weight) in weights {
        if !KNOWN_SCENARIOS.contains(&name.as_str()) {
            return Err(EngineError::Config(format!(
                "unknown scenario '{}' (known: {})",
                name,
                KNOWN_SCENARIOS.join(", ")
            )));
        }
        if users == 0 && *weight > 0.0 && NEEDS_USERS.contains(&name.as_str()) {
            return Err(EngineError::Config(format!(
                "scenario '{}' needs test users but users is 0",
                name
            )));
        }
    }
    Ok(())
}

/// Build the weighted wallet scenario set and its setup hook.
pub fn wallet_suite(
    weights: &BTreeMap<String, f64>,
    target: &TargetConfig,
) -> Result<(ScenarioSet<WalletFixture>, WalletSetup), EngineError> {
    check_scenarios(weights, target.users)?;
    let api = WalletApi::new(&target.base_url, target.request_timeout)
        .map_err(|e| EngineError::Config(format!("{:#}", e)))?;

    let entries = weights
        .iter()
        .filter_map(|(name, weight)| {
            build(name, &api, target.max_latency).map(|scenario| WeightedScenario {
                scenario,
                weight: *weight,
            })
        })
        .collect();
    let set = ScenarioSet::new(entries)?;
    let setup = WalletSetup {
        api,
        users: target.users,
    };
    Ok((set, setup))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(users: usize) -> TargetConfig {
        TargetConfig {
            base_url: "http://localhost:8080".to_string(),
            users,
            request_timeout: Duration::from_secs(1),
            max_latency: None,
        }
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(n, w)| (n.to_string(), *w)).collect()
    }

    #[test]
    fn test_builds_wallet_mix() {
        let (set, setup) = wallet_suite(
            &weights(&[("login", 0.4), ("deposit", 0.3), ("transfer", 0.2), ("balance", 0.1)]),
            &target(5),
        )
        .unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(setup.users, 5);
        let names: Vec<&str> = set.entries().iter().map(|e| e.scenario.name()).collect();
        assert!(names.contains(&"transfer"));
    }

    #[test]
    fn test_rejects_unknown_scenario() {
        let err = check_scenarios(&weights(&[("withdraw", 1.0)]), 5).unwrap_err();
        assert!(err.to_string().contains("unknown scenario 'withdraw'"));
    }

    #[test]
    fn test_user_scenarios_need_users() {
        assert!(check_scenarios(&weights(&[("deposit", 1.0)]), 0).is_err());
        assert!(check_scenarios(&weights(&[("deposit", 0.0), ("health", 1.0)]), 0).is_ok());
    }

    #[test]
    fn test_all_zero_weights_rejected() {
        assert!(matches!(
            wallet_suite(&weights(&[("health", 0.0)]), &target(0)),
            Err(EngineError::Config(_))
        ));
    }
}
