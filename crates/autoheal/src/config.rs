//! Service configuration.
//!
//! Loaded in three layers: built-in defaults, an optional TOML file, then
//! environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::adapters::fixer::ChatPlannerConfig;
use crate::adapters::github::GITHUB_API_URL;
use crate::error::ConfigError;
use crate::remediation::{CiWaitConfig, LoopSettings, OrchestratorSettings, ScoreConfig};

/// Upper bound for `ci.backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "loop")]
    pub loop_config: LoopConfig,
    pub ci: CiConfig,
    pub score: ScoreConfig,
    pub sandbox: SandboxConfig,
    pub github: GitHubConfig,
    /// Model fallback for fix generation; disabled without an API key
    pub llm: ChatPlannerConfig,
    pub server: ServerConfig,
}

/// Iteration budget and commit behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub push_attempts: u32,
    pub push_backoff_ms: u64,
    pub transient_retries: u32,
    pub commit_prefix: String,
    pub open_pull_request: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            push_attempts: 3,
            push_backoff_ms: 2000,
            transient_retries: 2,
            commit_prefix: "[AI-AGENT]".to_string(),
            open_pull_request: true,
        }
    }
}

/// CI polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    pub initial_poll_secs: u64,
    pub max_poll_secs: u64,
    pub backoff_multiplier: f64,
    pub timeout_secs: u64,
    pub max_query_errors: u32,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            initial_poll_secs: 15,
            max_poll_secs: 60,
            backoff_multiplier: 1.5,
            timeout_secs: 600,
            max_query_errors: 5,
        }
    }
}

/// Test execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Used when discovery is off or finds no known framework
    pub test_command: String,
    /// Detect pytest, unittest, jest or vitest from the working tree
    pub discover_framework: bool,
    pub timeout_secs: u64,
    /// Parent directory for working trees
    pub workspace_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            test_command: "python -m pytest -q".to_string(),
            discover_framework: true,
            timeout_secs: 300,
            workspace_dir: std::env::temp_dir().join("autoheal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: GITHUB_API_URL.to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&content)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("AUTOHEAL_MAX_ITERATIONS") {
            self.loop_config.max_iterations =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: "AUTOHEAL_MAX_ITERATIONS",
                    value,
                })?;
        }
        if let Some(value) = get("AUTOHEAL_TEST_COMMAND") {
            self.sandbox.test_command = value;
        }
        if let Some(value) = get("AUTOHEAL_BIND") {
            self.server.bind = value;
        }
        if let Some(value) = get("GITHUB_TOKEN") {
            self.github.token = Some(value);
        }
        if let Some(value) = get("GITHUB_API_BASE") {
            self.github.api_base = value;
        }
        if let Some(value) = get("LLM_API_BASE") {
            self.llm.api_base = value;
        }
        if let Some(value) = get("LLM_API_KEY") {
            self.llm.api_key = Some(value);
        }
        if let Some(value) = get("LLM_MODEL") {
            self.llm.model = value;
        }
        Ok(())
    }

    /// Reject values that would make the loop misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_config.max_iterations == 0 {
            return Err(ConfigError::Invalid("loop.max_iterations must be at least 1".into()));
        }
        if self.loop_config.push_attempts == 0 {
            return Err(ConfigError::Invalid("loop.push_attempts must be at least 1".into()));
        }
        if self.ci.initial_poll_secs > self.ci.max_poll_secs {
            return Err(ConfigError::Invalid(format!(
                "ci.initial_poll_secs ({}) exceeds ci.max_poll_secs ({})",
                self.ci.initial_poll_secs, self.ci.max_poll_secs
            )));
        }
        if self.ci.initial_poll_secs == 0 {
            return Err(ConfigError::Invalid("ci.initial_poll_secs must be at least 1".into()));
        }
        let multiplier = self.ci.backoff_multiplier;
        if !multiplier.is_finite() || !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&multiplier) {
            return Err(ConfigError::Invalid(format!(
                "ci.backoff_multiplier must be between 1.0 and {MAX_BACKOFF_MULTIPLIER}, got {multiplier}"
            )));
        }
        if self.sandbox.test_command.trim().is_empty() {
            return Err(ConfigError::Invalid("sandbox.test_command must not be empty".into()));
        }
        Ok(())
    }

    /// Whether the model fallback for fix generation is usable.
    #[must_use]
    pub fn llm_enabled(&self) -> bool {
        self.llm.api_key.is_some()
    }

    #[must_use]
    pub fn ci_wait_config(&self) -> CiWaitConfig {
        CiWaitConfig {
            initial_interval: Duration::from_secs(self.ci.initial_poll_secs),
            max_interval: Duration::from_secs(self.ci.max_poll_secs),
            multiplier: self.ci.backoff_multiplier,
            max_query_errors: self.ci.max_query_errors,
        }
    }

    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_iterations: self.loop_config.max_iterations,
            open_pull_request: self.loop_config.open_pull_request,
            loop_settings: LoopSettings {
                push_attempts: self.loop_config.push_attempts,
                push_backoff: Duration::from_millis(self.loop_config.push_backoff_ms),
                transient_retries: self.loop_config.transient_retries,
                commit_prefix: self.loop_config.commit_prefix.clone(),
                ci_wait: self.ci_wait_config(),
                ci_timeout: Duration::from_secs(self.ci.timeout_secs),
            },
            score: self.score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.loop_config.max_iterations, 5);
        assert_eq!(config.loop_config.commit_prefix, "[AI-AGENT]");
        assert_eq!(config.ci.timeout_secs, 600);
        assert_eq!(config.score.base, 100);
        assert_eq!(config.sandbox.test_command, "python -m pytest -q");
        assert!(config.sandbox.discover_framework);
        assert_eq!(config.github.api_base, "https://api.github.com");
        assert_eq!(config.server.bind, "0.0.0.0:8000");
        assert!(!config.llm_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [loop]
            max_iterations = 3
            commit_prefix = "[BOT]"

            [ci]
            initial_poll_secs = 5

            [sandbox]
            test_command = "npm test"
            discover_framework = false
            "#,
        )
        .unwrap();
        assert_eq!(config.loop_config.max_iterations, 3);
        assert_eq!(config.loop_config.push_attempts, 3);
        assert_eq!(config.loop_config.commit_prefix, "[BOT]");
        assert_eq!(config.ci.initial_poll_secs, 5);
        assert_eq!(config.ci.max_poll_secs, 60);
        assert_eq!(config.sandbox.test_command, "npm test");
        assert!(!config.sandbox.discover_framework);
        assert_eq!(config.sandbox.timeout_secs, 300);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("[loop]\nmax_iterations = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AUTOHEAL_MAX_ITERATIONS", "7"),
            ("GITHUB_TOKEN", "ghp_test"),
            ("LLM_API_KEY", "sk-test"),
            ("LLM_MODEL", "local-coder"),
            ("AUTOHEAL_BIND", ""),
        ]);
        let mut config = Config::default();
        config
            .apply_env_with(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.loop_config.max_iterations, 7);
        assert_eq!(config.github.token.as_deref(), Some("ghp_test"));
        assert_eq!(config.llm.model, "local-coder");
        assert!(config.llm_enabled());
        // Empty values are ignored
        assert_eq!(config.server.bind, "0.0.0.0:8000");
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(|key| (key == "AUTOHEAL_MAX_ITERATIONS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: "AUTOHEAL_MAX_ITERATIONS",
                ..
            }
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.loop_config.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ci.initial_poll_secs = 120;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.loop_config.push_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_degenerate_ci_polling() {
        let mut config = Config::default();
        config.ci.initial_poll_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("initial_poll_secs")));

        for multiplier in [f64::NAN, f64::INFINITY, 0.5, 10.5] {
            let mut config = Config::default();
            config.ci.backoff_multiplier = multiplier;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(ref msg)) if msg.contains("backoff_multiplier")),
                "multiplier {multiplier} should be rejected"
            );
        }

        let mut config = Config::default();
        config.ci.backoff_multiplier = MAX_BACKOFF_MULTIPLIER;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_orchestrator_settings() {
        let mut config = Config::default();
        config.loop_config.push_backoff_ms = 250;
        config.ci.timeout_secs = 90;

        let settings = config.orchestrator_settings();
        assert_eq!(settings.max_iterations, 5);
        assert!(settings.open_pull_request);
        assert_eq!(settings.loop_settings.push_backoff, Duration::from_millis(250));
        assert_eq!(settings.loop_settings.ci_timeout, Duration::from_secs(90));
        assert_eq!(
            settings.loop_settings.ci_wait.initial_interval,
            Duration::from_secs(15)
        );
    }

    #[test]
    #[serial]
    fn test_load_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[loop]\nmax_iterations = 4\n\n[server]\nbind = \"127.0.0.1:9000\"").unwrap();

        // SAFETY: This test runs serially via #[serial] to avoid env var races
        unsafe {
            std::env::set_var("AUTOHEAL_TEST_COMMAND", "make test");
            std::env::remove_var("AUTOHEAL_MAX_ITERATIONS");
        }
        let config = Config::load(Some(file.path())).unwrap();
        unsafe {
            std::env::remove_var("AUTOHEAL_TEST_COMMAND");
        }

        assert_eq!(config.loop_config.max_iterations, 4);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.sandbox.test_command, "make test");
    }

    #[test]
    #[serial]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/autoheal.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
