use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

/// Execution retry policy. Backoff doubles from `min_backoff_ms` up to
/// `max_backoff_ms`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub default_max_retries: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            min_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Retry `n` of a webhook waits `retry_delay_ms * n`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookSettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5000,
            timeout_secs: 30,
            poll_interval_ms: 10_000,
            batch_size: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Program (with arguments) spawned for every task attempt.
    pub command: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command: "cat".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            max_connections: db::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub config_version: String,
    pub workers: usize,
    pub default_timeout_secs: u64,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub webhook: WebhookSettings,
    pub executor: ExecutorSettings,
    pub database: DatabaseSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION.to_string(),
            workers: 4,
            default_timeout_secs: 300,
            scheduler: SchedulerSettings::default(),
            retry: RetrySettings::default(),
            webhook: WebhookSettings::default(),
            executor: ExecutorSettings::default(),
            database: DatabaseSettings::default(),
        }
    }
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        match serde_json::from_str::<Config>(&raw_config) {
            Ok(mut config) => {
                if config.config_version != CONFIG_VERSION {
                    tracing::info!(
                        "Config version '{}' upgraded to {}",
                        config.config_version,
                        CONFIG_VERSION
                    );
                    config.config_version = CONFIG_VERSION.to_string();
                }
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config: {}, using default", e);
                Self::default()
            }
        }
    }
}

impl Config {
    /// Applies `CONDUCTOR_*` overrides. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("CONDUCTOR_WORKERS") {
            self.workers = parse("CONDUCTOR_WORKERS", v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_POLL_INTERVAL_MS") {
            self.scheduler.poll_interval_ms = parse("CONDUCTOR_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_DEFAULT_TIMEOUT_SECS") {
            self.default_timeout_secs = parse("CONDUCTOR_DEFAULT_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_MAX_RETRIES") {
            self.retry.default_max_retries = parse("CONDUCTOR_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_WEBHOOK_MAX_RETRIES") {
            self.webhook.max_retries = parse("CONDUCTOR_WEBHOOK_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_WEBHOOK_RETRY_DELAY_MS") {
            self.webhook.retry_delay_ms = parse("CONDUCTOR_WEBHOOK_RETRY_DELAY_MS", v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_EXECUTOR_COMMAND")
            && !v.trim().is_empty()
        {
            self.executor.command = v;
        }

        if self.workers == 0 {
            return Err(ConfigError::InvalidEnv {
                key: "workers".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Reads the config file, falling back to defaults when it is missing or
/// unreadable.
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw_config) => Config::from(raw_config),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No config at {}, using defaults", config_path.display());
            Config::default()
        }
        Err(e) => {
            tracing::warn!("Failed to read {}: {}, using defaults", config_path.display(), e);
            Config::default()
        }
    }
}

pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let raw_config = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}
