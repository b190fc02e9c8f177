use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::generation::client::PollSettings;
use crate::generation::worker::WorkerSettings;

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absent → in-memory job store and no questionnaire data.
    pub database_url: Option<String>,
    pub anthropic_api_key: String,
    pub llm_model: String,
    pub port: u16,
    pub rust_log: String,
    pub worker: WorkerSettings,
    pub poll: PollSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            anthropic_api_key: String::new(),
            llm_model: crate::llm_client::DEFAULT_MODEL.to_string(),
            port: 8080,
            rust_log: "info".to_string(),
            worker: WorkerSettings::default(),
            poll: PollSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = Config::default();
        let config = Config {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            llm_model: std::env::var("LLM_MODEL").unwrap_or(defaults.llm_model),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or(defaults.rust_log),
            worker: WorkerSettings {
                watchdog: secs_env("GENERATION_WATCHDOG_SECS", defaults.worker.watchdog)?,
                grace: secs_env("GENERATION_GRACE_SECS", defaults.worker.grace)?,
                sweep_interval: secs_env(
                    "GENERATION_SWEEP_INTERVAL_SECS",
                    defaults.worker.sweep_interval,
                )?,
            },
            poll: PollSettings {
                interval: secs_env("CLIENT_POLL_INTERVAL_SECS", defaults.poll.interval)?,
                budget: secs_env("CLIENT_POLL_BUDGET_SECS", defaults.poll.budget)?,
            },
        };

        Ok(config)
    }

    /// Logs settings that are legal but likely misconfigured. Call after logging is up.
    pub fn log_warnings(&self) {
        if self.poll.budget < self.worker.watchdog {
            warn!(
                "CLIENT_POLL_BUDGET_SECS ({}s) is shorter than the watchdog ({}s); \
                 clients may stop polling before a job is settled",
                self.poll.budget.as_secs(),
                self.worker.watchdog.as_secs()
            );
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

/// Reads a positive number of seconds, falling back to `default` when unset.
fn secs_env(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => parse_secs(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{key} must be a whole number of seconds"))?;
    anyhow::ensure!(secs > 0, "{key} must be greater than zero");
    Ok(Duration::from_secs(secs))
}
