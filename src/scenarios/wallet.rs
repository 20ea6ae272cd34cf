//! Wallet API scenarios: login, deposit, transfer, balance and health checks.

use anyhow::{anyhow, bail, Context};
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::engine::dispatch::{IterationContext, Scenario, Verdict};
use crate::engine::Lifecycle;
use crate::error::ScenarioError;
use crate::stats::MetricsRegistry;

pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const ERRORS: &str = "errors";

const TEST_PASSWORD: &str = "TestPassword123!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUser {
    pub email: String,
    pub password: String,
}

/// Accounts provisioned during setup, shared by every VU.
#[derive(Debug, Clone, Default)]
pub struct WalletFixture {
    pub users: Vec<TestUser>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub status: u16,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceResponse {
    pub status: u16,
    pub balance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub elapsed: Duration,
}

/// Top-level field of a successful JSON body.
fn json_field(res: Response, field: &str) -> Option<Value> {
    if res.status() != StatusCode::OK {
        return None;
    }
    res.json::<Value>().ok()?.get(field).cloned()
}

#[derive(Clone)]
pub struct WalletApi {
    client: Client,
    base_url: String,
}

impl WalletApi {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, recording `http_req_duration` and `http_req_failed`.
    /// Statuses of 400 and above count as failed requests.
    fn send(&self, metrics: &MetricsRegistry, request: RequestBuilder) -> anyhow::Result<Response> {
        let started = Instant::now();
        let result = request.send();
        let millis = started.elapsed().as_secs_f64() * 1000.0;
        let failed = match &result {
            Ok(res) => res.status().as_u16() >= 400,
            Err(_) => true,
        };
        metrics.record_trend(HTTP_REQ_DURATION, millis)?;
        metrics.record_rate(HTTP_REQ_FAILED, failed)?;
        Ok(result?)
    }

    pub fn login(&self, metrics: &MetricsRegistry, user: &TestUser) -> anyhow::Result<LoginResponse> {
        let res = self.send(
            metrics,
            self.client
                .post(self.url("/api/login"))
                .json(&json!({ "email": user.email, "password": user.password })),
        )?;
        let status = res.status().as_u16();
        let token = json_field(res, "token").and_then(|v| v.as_str().map(str::to_string));
        Ok(LoginResponse { status, token })
    }

    /// Returns the response status.
    pub fn deposit(&self, metrics: &MetricsRegistry, token: &str, amount: u64) -> anyhow::Result<u16> {
        let res = self.send(
            metrics,
            self.client
                .post(self.url("/api/deposit"))
                .bearer_auth(token)
                .json(&json!({ "amount": amount, "callback_url": "https://webhook.site/test" })),
        )?;
        Ok(res.status().as_u16())
    }

    /// Returns the response status; 400 means insufficient funds.
    pub fn transfer(&self, metrics: &MetricsRegistry, token: &str, amount: u64) -> anyhow::Result<u16> {
        let res = self.send(
            metrics,
            self.client
                .post(self.url("/api/transfer"))
                .bearer_auth(token)
                .json(&json!({ "to_user_id": "recipient-uuid-here", "amount": amount })),
        )?;
        Ok(res.status().as_u16())
    }

    pub fn balance(&self, metrics: &MetricsRegistry, token: &str) -> anyhow::Result<BalanceResponse> {
        let res = self.send(
            metrics,
            self.client.get(self.url("/api/balance")).bearer_auth(token),
        )?;
        let status = res.status().as_u16();
        let balance = json_field(res, "balance").and_then(|v| v.as_f64());
        Ok(BalanceResponse { status, balance })
    }

    /// GET `path`; `elapsed` covers the whole request.
    pub fn probe(&self, metrics: &MetricsRegistry, path: &str) -> anyhow::Result<ProbeResponse> {
        let started = Instant::now();
        let res = self.send(metrics, self.client.get(self.url(path)))?;
        Ok(ProbeResponse {
            status: res.status().as_u16(),
            elapsed: started.elapsed(),
        })
    }

    /// Create a test account; false when the service refused it.
    pub fn create_user(&self, user: &TestUser) -> anyhow::Result<bool> {
        let res = self
            .client
            .post(self.url("/api/users"))
            .json(&json!({ "email": user.email, "password": user.password }))
            .send()?;
        Ok(matches!(res.status().as_u16(), 200 | 201))
    }
}

/// Record the custom `errors` rate and a per-operation trend.
fn observe(ctx: &IterationContext<'_, WalletFixture>, trend: &str, started: Instant, error: bool) {
    let metrics = ctx.metrics();
    let millis = started.elapsed().as_secs_f64() * 1000.0;
    if let Err(e) = metrics
        .record_rate(ERRORS, error)
        .and_then(|_| metrics.record_trend(trend, millis))
    {
        warn!(error = %e, "Failed to record scenario metric");
    }
}

fn pick_user<'a>(ctx: &mut IterationContext<'a, WalletFixture>) -> Result<&'a TestUser, ScenarioError> {
    let fixture: &'a WalletFixture = ctx.fixture;
    fixture
        .users
        .choose(&mut *ctx.rng)
        .ok_or_else(|| ScenarioError::Other(anyhow!("no test users available")))
}

/// Timed login step shared by every authenticated scenario.
fn login(api: &WalletApi, ctx: &mut IterationContext<'_, WalletFixture>) -> Result<String, ScenarioError> {
    let user = pick_user(ctx)?;
    let started = Instant::now();
    let token = ctx.step("login", |c| {
        let res = api.login(c.metrics(), user);
        let status_ok = c.check("login status 200", matches!(&res, Ok(r) if r.status == 200));
        c.check("login has token", matches!(&res, Ok(r) if r.token.is_some()));
        let res = res?;
        if !status_ok {
            bail!("login status {}", res.status);
        }
        res.token.ok_or_else(|| anyhow!("login response has no token"))
    });
    observe(ctx, "login_duration", started, token.is_err());
    token
}

pub struct Login {
    pub api: WalletApi,
}

impl Scenario<WalletFixture> for Login {
    fn name(&self) -> &str {
        "login"
    }

    fn steps(&self) -> &[&'static str] {
        &["login"]
    }

    fn run(&self, ctx: &mut IterationContext<'_, WalletFixture>) -> Result<Verdict, ScenarioError> {
        login(&self.api, ctx)?;
        Ok(Verdict::Success)
    }
}

pub struct Deposit {
    pub api: WalletApi,
}

impl Scenario<WalletFixture> for Deposit {
    fn name(&self) -> &str {
        "deposit"
    }

    fn steps(&self) -> &[&'static str] {
        &["login", "deposit"]
    }

    fn run(&self, ctx: &mut IterationContext<'_, WalletFixture>) -> Result<Verdict, ScenarioError> {
        let token = login(&self.api, ctx)?;
        let amount = ctx.rng.gen_range(10..=1010);
        let started = Instant::now();
        let result = ctx.step("deposit", |c| {
            let status = self.api.deposit(c.metrics(), &token, amount);
            let ok = c.check("deposit status 200", matches!(status, Ok(200 | 201)));
            let status = status?;
            if !ok {
                bail!("deposit status {}", status);
            }
            Ok(())
        });
        observe(ctx, "deposit_duration", started, result.is_err());
        result?;
        Ok(Verdict::Success)
    }
}

pub struct Transfer {
    pub api: WalletApi,
}

impl Scenario<WalletFixture> for Transfer {
    fn name(&self) -> &str {
        "transfer"
    }

    fn steps(&self) -> &[&'static str] {
        &["login", "transfer"]
    }

    fn run(&self, ctx: &mut IterationContext<'_, WalletFixture>) -> Result<Verdict, ScenarioError> {
        let token = login(&self.api, ctx)?;
        let amount = ctx.rng.gen_range(1..=100);
        let started = Instant::now();
        let result = ctx.step("transfer", |c| {
            let status = self.api.transfer(c.metrics(), &token, amount);
            let ok = c.check("transfer status ok", matches!(status, Ok(200 | 400)));
            let status = status?;
            if !ok {
                bail!("transfer status {}", status);
            }
            Ok(status)
        });
        // A 400 is an expected refusal, not an error
        observe(ctx, "transfer_duration", started, result.is_err());
        match result? {
            400 => Ok(Verdict::Rejected("insufficient funds".to_string())),
            _ => Ok(Verdict::Success),
        }
    }
}

pub struct Balance {
    pub api: WalletApi,
}

impl Scenario<WalletFixture> for Balance {
    fn name(&self) -> &str {
        "balance"
    }

    fn steps(&self) -> &[&'static str] {
        &["login", "balance"]
    }

    fn run(&self, ctx: &mut IterationContext<'_, WalletFixture>) -> Result<Verdict, ScenarioError> {
        let token = login(&self.api, ctx)?;
        let result = ctx.step("balance", |c| {
            let res = self.api.balance(c.metrics(), &token);
            let status_ok = c.check("balance status 200", matches!(&res, Ok(r) if r.status == 200));
            c.check("balance has value", matches!(&res, Ok(r) if r.balance.is_some()));
            let res = res?;
            if !status_ok {
                bail!("balance status {}", res.status);
            }
            res.balance.ok_or_else(|| anyhow!("balance response has no balance"))
        });
        if let Err(e) = ctx.metrics().record_rate(ERRORS, result.is_err()) {
            warn!(error = %e, "Failed to record scenario metric");
        }
        result?;
        Ok(Verdict::Success)
    }
}

/// GET one of `endpoints`, chosen uniformly per iteration.
///
/// Checks `status is 200` and `no errors` on every request, plus a
/// `response time < N ms` check when `max_latency` is set. A slow request
/// fails its check but not the iteration.
pub struct Health {
    pub api: WalletApi,
    pub name: &'static str,
    pub endpoints: &'static [&'static str],
    pub max_latency: Option<Duration>,
}

impl Scenario<WalletFixture> for Health {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, ctx: &mut IterationContext<'_, WalletFixture>) -> Result<Verdict, ScenarioError> {
        let path = self
            .endpoints
            .choose(&mut *ctx.rng)
            .copied()
            .unwrap_or("/health");
        ctx.step(path, |c| {
            let res = self.api.probe(c.metrics(), path);
            c.check("no errors", res.is_ok());
            let status_ok = c.check("status is 200", matches!(&res, Ok(r) if r.status == 200));
            if let Some(limit) = self.max_latency {
                c.check(
                    &format!("response time < {}ms", limit.as_millis()),
                    matches!(&res, Ok(r) if r.elapsed < limit),
                );
            }
            let res = res?;
            if !status_ok {
                bail!("{} status {}", path, res.status);
            }
            Ok(())
        })?;
        Ok(Verdict::Success)
    }
}

/// Provisions `users` accounts before the run.
pub struct WalletSetup {
    pub api: WalletApi,
    pub users: usize,
}

impl Lifecycle<WalletFixture> for WalletSetup {
    fn setup(&self) -> anyhow::Result<WalletFixture> {
        info!(base_url = %self.api.base_url, "Starting load test");
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut users = Vec::with_capacity(self.users);
        for i in 0..self.users {
            let user = TestUser {
                email: format!("loadtest_user_{}_{}@example.com", i, stamp),
                password: TEST_PASSWORD.to_string(),
            };
            match self.api.create_user(&user) {
                Ok(true) => users.push(user),
                Ok(false) => warn!(email = %user.email, "Service refused test user"),
                Err(e) => warn!(email = %user.email, error = %e, "Could not create test user"),
            }
        }
        if self.users > 0 && users.is_empty() {
            bail!("none of {} test users could be created", self.users);
        }
        info!(created = users.len(), "Setup completed");
        Ok(WalletFixture { users })
    }

    fn teardown(&self, fixture: &WalletFixture) -> anyhow::Result<()> {
        info!(users = fixture.users.len(), "Cleaning up test data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatch::{OutcomeStatus, ScenarioSet, StepStatus};
    use crate::stats::{check_metric, CHECKS};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    /// Minimal HTTP/1.1 stub: maps "METHOD /path" to (status, body).
    fn stub(routes: &'static [(&'static str, u16, &'static str)]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                let mut length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if let Some(v) = lower.strip_prefix("content-length:") {
                        length = v.trim().parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0u8; length];
                let _ = reader.read_exact(&mut body);

                let key: String = request_line.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                let (status, body) = routes
                    .iter()
                    .find(|(k, _, _)| *k == key)
                    .map(|(_, s, b)| (*s, *b))
                    .unwrap_or((404, ""));
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    fn api(base: &str) -> WalletApi {
        WalletApi::new(base, Duration::from_secs(5)).unwrap()
    }

    fn fixture() -> WalletFixture {
        WalletFixture {
            users: vec![TestUser {
                email: "loadtest_user_0@example.com".to_string(),
                password: TEST_PASSWORD.to_string(),
            }],
        }
    }

    fn run(scenario: impl Scenario<WalletFixture> + 'static, registry: &MetricsRegistry) -> crate::engine::dispatch::IterationOutcome {
        let set = ScenarioSet::single(Arc::new(scenario)).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        set.dispatch(0, 0, &fixture(), registry, &mut rng)
    }

    #[test]
    fn test_deposit_success() {
        let base = stub(&[
            ("POST /api/login", 200, r#"{"token":"abc"}"#),
            ("POST /api/deposit", 201, "{}"),
        ]);
        let registry = MetricsRegistry::default();
        let outcome = run(Deposit { api: api(&base) }, &registry);
        assert_eq!(outcome.status, OutcomeStatus::Success, "{:?}", outcome.error);
        assert_eq!(registry.snapshot().rate(CHECKS).unwrap(), 1.0);
        assert_eq!(
            registry.snapshot().rate(&check_metric("login has token")).unwrap(),
            1.0
        );

        let snap = registry.snapshot();
        assert_eq!(snap.trend(HTTP_REQ_DURATION).unwrap().count(), 2);
        assert_eq!(snap.rate(HTTP_REQ_FAILED).unwrap(), 0.0);
        assert_eq!(snap.rate(ERRORS).unwrap(), 0.0);
        assert_eq!(snap.trend("deposit_duration").unwrap().count(), 1);
    }

    #[test]
    fn test_failed_login_skips_deposit() {
        let base = stub(&[("POST /api/login", 401, "{}")]);
        let registry = MetricsRegistry::default();
        let outcome = run(Deposit { api: api(&base) }, &registry);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.steps[1].name, "deposit");
        assert_eq!(outcome.steps[1].status, StepStatus::Skipped);

        let snap = registry.snapshot();
        assert_eq!(snap.trend(HTTP_REQ_DURATION).unwrap().count(), 1);
        assert_eq!(snap.rate(ERRORS).unwrap(), 1.0);
    }

    #[test]
    fn test_transfer_400_is_rejected_not_error() {
        let base = stub(&[
            ("POST /api/login", 200, r#"{"token":"abc"}"#),
            ("POST /api/transfer", 400, r#"{"error":"insufficient funds"}"#),
        ]);
        let registry = MetricsRegistry::default();
        let outcome = run(Transfer { api: api(&base) }, &registry);
        assert_eq!(outcome.status, OutcomeStatus::Rejected);
        assert_eq!(registry.snapshot().rate(ERRORS).unwrap(), 0.0);
    }

    #[test]
    fn test_transfer_500_fails() {
        let base = stub(&[
            ("POST /api/login", 200, r#"{"token":"abc"}"#),
            ("POST /api/transfer", 500, "{}"),
        ]);
        let registry = MetricsRegistry::default();
        let outcome = run(Transfer { api: api(&base) }, &registry);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("transfer status 500"));
    }

    #[test]
    fn test_balance_requires_value() {
        let base = stub(&[
            ("POST /api/login", 200, r#"{"token":"abc"}"#),
            ("GET /api/balance", 200, r#"{"currency":"BRL"}"#),
        ]);
        let registry = MetricsRegistry::default();
        let outcome = run(Balance { api: api(&base) }, &registry);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("no balance"));
        let snap = registry.snapshot();
        assert_eq!(snap.rate(&check_metric("balance status 200")).unwrap(), 1.0);
        assert_eq!(snap.rate(&check_metric("balance has value")).unwrap(), 0.0);
    }

    #[test]
    fn test_health_endpoint() {
        let base = stub(&[("GET /health", 200, "{}"), ("GET /ready", 503, "{}")]);
        let registry = MetricsRegistry::default();
        let ok = run(
            Health {
                api: api(&base),
                name: "health",
                endpoints: &["/health"],
                max_latency: None,
            },
            &registry,
        );
        assert!(ok.success());
        let down = run(
            Health {
                api: api(&base),
                name: "ready",
                endpoints: &["/ready"],
                max_latency: None,
            },
            &registry,
        );
        assert_eq!(down.status, OutcomeStatus::Failed);

        let snap = registry.snapshot();
        assert_eq!(snap.rate(HTTP_REQ_FAILED).unwrap(), 0.5);
        assert_eq!(snap.rate(&check_metric("status is 200")).unwrap(), 0.5);
        assert_eq!(snap.rate(&check_metric("no errors")).unwrap(), 1.0);
    }

    #[test]
    fn test_health_latency_check_fails_without_failing_iteration() {
        let base = stub(&[("GET /health", 200, "{}")]);
        let registry = MetricsRegistry::default();
        let outcome = run(
            Health {
                api: api(&base),
                name: "health",
                endpoints: &["/health"],
                max_latency: Some(Duration::ZERO),
            },
            &registry,
        );
        assert!(outcome.success());

        let snap = registry.snapshot();
        assert_eq!(snap.rate(&check_metric("response time < 0ms")).unwrap(), 0.0);
        assert_eq!(snap.rate(&check_metric("status is 200")).unwrap(), 1.0);
        assert_eq!(snap.rate(CHECKS).unwrap(), 2.0 / 3.0);
    }

    #[test]
    fn test_health_transport_error_fails_checks() {
        // Nothing listens on a freshly released port
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let registry = MetricsRegistry::default();
        let outcome = run(
            Health {
                api: api(&format!("http://127.0.0.1:{}", port)),
                name: "health",
                endpoints: &["/health"],
                max_latency: Some(Duration::from_millis(200)),
            },
            &registry,
        );
        assert_eq!(outcome.status, OutcomeStatus::Failed);

        let snap = registry.snapshot();
        assert_eq!(snap.rate(&check_metric("no errors")).unwrap(), 0.0);
        assert_eq!(snap.rate(CHECKS).unwrap(), 0.0);
        assert_eq!(snap.rate(HTTP_REQ_FAILED).unwrap(), 1.0);
    }

    #[test]
    fn test_setup_provisions_users() {
        let base = stub(&[("POST /api/users", 201, "{}")]);
        let setup = WalletSetup {
            api: api(&base),
            users: 3,
        };
        let fixture = setup.setup().unwrap();
        assert_eq!(fixture.users.len(), 3);
        assert!(fixture.users[0].email.starts_with("loadtest_user_0_"));
    }

    #[test]
    fn test_setup_fails_when_no_user_created() {
        let base = stub(&[("POST /api/users", 500, "{}")]);
        let setup = WalletSetup {
            api: api(&base),
            users: 2,
        };
        let err = setup.setup().unwrap_err();
        assert!(err.to_string().contains("none of 2"));

        let none_needed = WalletSetup {
            api: api(&base),
            users: 0,
        };
        assert!(none_needed.setup().unwrap().users.is_empty());
    }
}
