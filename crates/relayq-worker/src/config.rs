//! Worker configuration
//!
//! Loaded from a JSON file (path in `RELAYQ_CONFIG`, default
//! `relayq.json`). Validated eagerly: a bad subscription is fatal at
//! startup and the process exits non-zero.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use relayq_transport::ReconnectConfig;
use relayq_types::SubscriptionConfig;
use serde::Deserialize;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "RELAYQ_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "relayq.json";

/// Top-level worker configuration
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Broker connection settings
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Queue subscriptions, at least one
    pub subscriptions: Vec<SubscriptionConfig>,

    /// How long shutdown waits for in-flight deliveries
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Reconnect/backoff settings for the broker connection
#[derive(Debug, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
        }
    }
}

impl WorkerConfig {
    /// Load the config file named by `RELAYQ_CONFIG` (or the default path)
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_path(Path::new(&path))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.subscriptions.is_empty() {
            anyhow::bail!("at least one subscription is required");
        }
        for subscription in &self.subscriptions {
            subscription
                .validate()
                .with_context(|| format!("subscription '{}'", subscription.queue))?;
        }
        Ok(())
    }
}
