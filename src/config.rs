//! Operator configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::orchestrator::Intervals;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Scope
    pub watch_namespace: Option<String>,

    // Servers
    pub health_port: u16,
    pub metrics_port: u16,

    // Notifications
    pub slack_webhook_url: Option<String>,

    // Requeue intervals (seconds)
    pub precheck_poll_interval: u64,
    pub approval_poll_interval: u64,
    pub rollout_poll_interval: u64,
    pub conflict_retry: u64,

    // Collaborators
    pub health_probe_timeout: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            watch_namespace: optional("WATCH_NAMESPACE"),
            health_port: parse_with_default(&lookup, "HEALTH_PORT", 8080)?,
            metrics_port: parse_with_default(&lookup, "METRICS_PORT", 8081)?,
            slack_webhook_url: optional("SLACK_WEBHOOK_URL"),
            precheck_poll_interval: parse_with_default(&lookup, "PRECHECK_POLL_INTERVAL_SECS", 120)?,
            approval_poll_interval: parse_with_default(&lookup, "APPROVAL_POLL_INTERVAL_SECS", 300)?,
            rollout_poll_interval: parse_with_default(&lookup, "ROLLOUT_POLL_INTERVAL_SECS", 120)?,
            conflict_retry: parse_with_default(&lookup, "CONFLICT_RETRY_SECS", 5)?,
            health_probe_timeout: parse_with_default(&lookup, "HEALTH_PROBE_TIMEOUT_SECS", 5)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_port == self.metrics_port {
            return Err(anyhow!(
                "HEALTH_PORT and METRICS_PORT must differ (both {})",
                self.health_port
            ));
        }

        for (key, value) in [
            ("PRECHECK_POLL_INTERVAL_SECS", self.precheck_poll_interval),
            ("APPROVAL_POLL_INTERVAL_SECS", self.approval_poll_interval),
            ("ROLLOUT_POLL_INTERVAL_SECS", self.rollout_poll_interval),
            ("CONFLICT_RETRY_SECS", self.conflict_retry),
            ("HEALTH_PROBE_TIMEOUT_SECS", self.health_probe_timeout),
        ] {
            if value == 0 {
                return Err(anyhow!("{key} must be greater than zero"));
            }
        }

        if let Some(ref url) = self.slack_webhook_url
            && !url.starts_with("https://")
        {
            return Err(anyhow!("SLACK_WEBHOOK_URL must be an https:// URL"));
        }

        Ok(())
    }

    pub const fn intervals(&self) -> Intervals {
        Intervals {
            precheck_poll: Duration::from_secs(self.precheck_poll_interval),
            approval_poll: Duration::from_secs(self.approval_poll_interval),
            rollout_poll: Duration::from_secs(self.rollout_poll_interval),
            conflict_retry: Duration::from_secs(self.conflict_retry),
        }
    }

    pub const fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout)
    }
}

fn parse_with_default<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Environment variable {key} has invalid value '{raw}'")),
        _ => Ok(default),
    }
}
