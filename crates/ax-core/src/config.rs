use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::JsonMap;

/// Top-level configuration loaded from `~/.agent-exec/config.toml`.
///
/// Every section is optional; missing sections fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

impl Config {
    /// Load config from `~/.agent-exec/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runner.validate()?;
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("remote.base_url must not be empty".into()));
        }
        if self.remote.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "remote.request_timeout_secs must be greater than zero".into(),
            ));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate agent id: {}",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent-exec")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_service_name() -> String {
    "agent-exec".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.agent-exec/executions.db".into()
}

/// What the runner does when a human rejects (or never answers) an
/// approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Record `human_approval: false` in the result and complete.
    #[default]
    Complete,
    /// Record the rejection as the error and fail the execution.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default)]
    pub approval_rejection: RejectionPolicy,
    #[serde(default = "default_approval_priority")]
    pub approval_priority: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout_secs(),
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            cancel_grace_secs: default_cancel_grace_secs(),
            approval_rejection: RejectionPolicy::default(),
            approval_priority: default_approval_priority(),
        }
    }
}

impl RunnerConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.approval_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "runner.approval_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.pause_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "runner.pause_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.cancel_grace_secs == 0 {
            return Err(ConfigError::Validation(
                "runner.cancel_grace_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_approval_timeout_secs() -> u64 {
    3600
}
fn default_pause_poll_interval_ms() -> u64 {
    250
}
fn default_cancel_grace_secs() -> u64 {
    10
}
fn default_approval_priority() -> String {
    "high".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_remote_base_url() -> String {
    "http://127.0.0.1:8100".into()
}
fn default_request_timeout_secs() -> u64 {
    300
}

/// Static agent directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: Uuid,
    pub agent_type: String,
    #[serde(default)]
    pub configuration: JsonMap,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
