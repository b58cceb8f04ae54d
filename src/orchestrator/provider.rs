//! Provider registry: turns a [`SpawnSpec`] into a concrete command line
//! for the configured agent CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{GlobalConfig, ProviderConfig};
use crate::{AppError, Result};

/// Everything needed to start one agent CLI process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Provider name, a key of the registry.
    pub provider: String,
    /// Prompt handed to the CLI.
    pub prompt: String,
    /// Working directory (usually a provisioned worktree).
    pub working_directory: PathBuf,
    /// Conversation id pre-assigned by the orchestrator.
    pub cli_session_id: Option<String>,
    /// Prior conversation to resume.
    pub resume_id: Option<String>,
    /// Model override.
    pub model_override: Option<String>,
    /// Tools the agent may use; empty means the CLI default.
    pub allowed_tools: Vec<String>,
    /// Additional arguments appended verbatim.
    pub extra_args: Vec<String>,
    /// Extra environment variables for the process.
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    /// Minimal spec for `provider` running `prompt` in `working_directory`.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        prompt: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider: provider.into(),
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            cli_session_id: None,
            resume_id: None,
            model_override: None,
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// Program and argument vector ready for spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable.
    pub program: String,
    /// Arguments in order.
    pub args: Vec<String>,
}

/// Known providers keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// Registry over an explicit provider table.
    #[must_use]
    pub fn new(providers: BTreeMap<String, ProviderConfig>) -> Self {
        Self { providers }
    }

    /// Registry over the providers in `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.providers.clone())
    }

    /// Look up a provider definition.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Whether `name` can resume prior conversations.
    #[must_use]
    pub fn supports_resume(&self, name: &str) -> bool {
        self.get(name).is_some_and(|provider| provider.supports_resume)
    }

    /// Whether the orchestrator should pre-assign a conversation id.
    #[must_use]
    pub fn assigns_session_id(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|provider| provider.session_id_flag.is_some())
    }

    /// Names of all resumable providers.
    #[must_use]
    pub fn resumable_providers(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, provider)| provider.supports_resume)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Build the command line for `spec`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` for an unknown provider and
    /// `AppError::ResumeUnsupported` when `spec.resume_id` is set for a
    /// provider that cannot resume.
    pub fn build_command(&self, spec: &SpawnSpec) -> Result<CommandLine> {
        let provider = self
            .get(&spec.provider)
            .ok_or_else(|| AppError::Spawn(format!("unknown provider: {}", spec.provider)))?;

        let mut args = provider.args.clone();

        if let Some(ref flag) = provider.prompt_flag {
            args.push(flag.clone());
        }
        args.push(spec.prompt.clone());

        match (&spec.resume_id, &provider.resume_flag) {
            (Some(resume_id), Some(flag)) if provider.supports_resume => {
                args.push(flag.clone());
                args.push(resume_id.clone());
            }
            (Some(_), _) => {
                return Err(AppError::ResumeUnsupported {
                    provider: spec.provider.clone(),
                });
            }
            (None, _) => {
                if let (Some(id), Some(flag)) = (&spec.cli_session_id, &provider.session_id_flag) {
                    args.push(flag.clone());
                    args.push(id.clone());
                }
            }
        }

        if let (Some(model), Some(flag)) = (&spec.model_override, &provider.model_flag) {
            args.push(flag.clone());
            args.push(model.clone());
        }

        if let (false, Some(flag)) = (spec.allowed_tools.is_empty(), &provider.allowed_tools_flag) {
            args.push(flag.clone());
            args.push(spec.allowed_tools.join(","));
        }

        args.extend(spec.extra_args.iter().cloned());

        Ok(CommandLine {
            program: provider.command.clone(),
            args,
        })
    }
}
