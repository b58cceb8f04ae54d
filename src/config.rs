//! Global configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Watcher loop tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatcherConfig {
    /// Interval between supervisor status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2000
}

/// Process supervisor limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Time between the graceful termination signal and a forced kill.
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
    /// Maximum bytes retained per captured stream.
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    /// How long to wait after exit for stdout/stderr to close.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cancel_grace_seconds: default_cancel_grace_seconds(),
            output_limit_bytes: default_output_limit_bytes(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_cancel_grace_seconds() -> u64 {
    5
}

fn default_output_limit_bytes() -> usize {
    1024 * 1024
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

/// Push delivery settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryConfig {
    /// Interval between keepalive pings on each push connection.
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            keepalive_seconds: default_keepalive_seconds(),
        }
    }
}

fn default_keepalive_seconds() -> u64 {
    15
}

/// How to invoke one external agent CLI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderConfig {
    /// Binary to execute.
    pub command: String,
    /// Arguments placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag preceding the prompt; the prompt is positional when absent.
    #[serde(default)]
    pub prompt_flag: Option<String>,
    /// Flag used to pre-assign the CLI conversation id.
    #[serde(default)]
    pub session_id_flag: Option<String>,
    /// Flag used to resume a prior conversation.
    #[serde(default)]
    pub resume_flag: Option<String>,
    /// Flag used to override the model.
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Flag carrying the comma-separated allowed tool set.
    #[serde(default)]
    pub allowed_tools_flag: Option<String>,
    /// Whether the CLI can resume a prior conversation.
    #[serde(default)]
    pub supports_resume: bool,
}

impl ProviderConfig {
    fn claude() -> Self {
        Self {
            command: "claude".into(),
            args: vec!["--output-format".into(), "text".into()],
            prompt_flag: Some("-p".into()),
            session_id_flag: Some("--session-id".into()),
            resume_flag: Some("--resume".into()),
            model_flag: Some("--model".into()),
            allowed_tools_flag: Some("--allowedTools".into()),
            supports_resume: true,
        }
    }

    fn codex() -> Self {
        Self {
            command: "codex".into(),
            args: vec!["exec".into()],
            prompt_flag: None,
            session_id_flag: None,
            resume_flag: None,
            model_flag: Some("--model".into()),
            allowed_tools_flag: None,
            supports_resume: false,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/agent-conductor.db")
}

fn default_http_port() -> u16 {
    3000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// HTTP port for the API and push channel.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Watcher loop settings.
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Push delivery settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// External CLI definitions keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let mut config = Self {
            db_path: default_db_path(),
            http_port: default_http_port(),
            watcher: WatcherConfig::default(),
            supervisor: SupervisorConfig::default(),
            delivery: DeliveryConfig::default(),
            providers: BTreeMap::new(),
        };
        config.install_builtin_providers();
        config
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.install_builtin_providers();
        config.validate()?;
        Ok(config)
    }

    /// Watcher poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.poll_interval_ms)
    }

    /// Grace period between terminate and kill.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.cancel_grace_seconds)
    }

    /// Post-exit pipe drain timeout.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.drain_timeout_ms)
    }

    /// Keepalive interval for push connections.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.delivery.keepalive_seconds)
    }

    fn install_builtin_providers(&mut self) {
        if self.providers.is_empty() {
            self.providers.insert("claude".into(), ProviderConfig::claude());
            self.providers.insert("codex".into(), ProviderConfig::codex());
        }
    }

    fn validate(&self) -> Result<()> {
        if self.watcher.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "watcher.poll_interval_ms must be greater than zero".into(),
            ));
        }

        if self.delivery.keepalive_seconds == 0 {
            return Err(AppError::Config(
                "delivery.keepalive_seconds must be greater than zero".into(),
            ));
        }

        if self.supervisor.output_limit_bytes == 0 {
            return Err(AppError::Config(
                "supervisor.output_limit_bytes must be greater than zero".into(),
            ));
        }

        if let Some((name, _)) = self
            .providers
            .iter()
            .find(|(_, provider)| provider.command.trim().is_empty())
        {
            return Err(AppError::Config(format!(
                "provider {name} has an empty command"
            )));
        }

        Ok(())
    }
}
