//! Configuration loader and validator for the relay.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dispatch::RetryPolicy;
use crate::model::ChannelKind;
use crate::orchestrator::OrchestratorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub schedule: Schedule,
    pub channels: BTreeMap<ChannelKind, ChannelEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Falls back to `sqlite://{data_dir}/relay.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Per-channel retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Dispatch {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            attempt_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Schedule {
    pub past_grace_secs: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self { past_grace_secs: 5 }
    }
}

/// Delivery endpoint of one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelEndpoint {
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file, which wins over the data_dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/relay.db", self.app.data_dir))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatch.max_attempts,
            initial_backoff: Duration::from_millis(self.dispatch.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.dispatch.max_backoff_ms),
            attempt_timeout: Duration::from_millis(self.dispatch.attempt_timeout_ms),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retry: self.retry_policy(),
            past_schedule_grace: chrono::Duration::seconds(self.schedule.past_grace_secs as i64),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if matches!(&cfg.app.database_url, Some(url) if url.trim().is_empty()) {
        return Err(ConfigError::Invalid("app.database_url must be non-empty when set"));
    }

    let d = &cfg.dispatch;
    if d.max_attempts == 0 {
        return Err(ConfigError::Invalid("dispatch.max_attempts must be > 0"));
    }
    if d.initial_backoff_ms > d.max_backoff_ms {
        return Err(ConfigError::Invalid(
            "dispatch.initial_backoff_ms must not exceed dispatch.max_backoff_ms",
        ));
    }
    if d.attempt_timeout_ms == 0 {
        return Err(ConfigError::Invalid("dispatch.attempt_timeout_ms must be > 0"));
    }

    if cfg.channels.is_empty() {
        return Err(ConfigError::Invalid("channels must configure at least one channel"));
    }
    for channel in cfg.channels.values() {
        match Url::parse(channel.endpoint.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "channels.*.endpoint must be an http(s) URL",
                ))
            }
        }
    }

    Ok(())
}

/// Example YAML covering every section.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

dispatch:
  max_attempts: 3
  initial_backoff_ms: 500
  max_backoff_ms: 10000
  attempt_timeout_ms: 30000

schedule:
  past_grace_secs: 5

channels:
  email:
    endpoint: "https://mail-relay.example.com/v1/send"
    token: "YOUR_MAIL_RELAY_TOKEN"
  web:
    endpoint: "https://cms.example.com/hooks/publish"
    token: "YOUR_CMS_TOKEN"
  twitter:
    endpoint: "https://social.example.com/v1/twitter"
    token: "YOUR_SOCIAL_TOKEN"
"#
}
