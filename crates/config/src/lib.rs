//! Configuration loading, validation, and management for axon.
//!
//! Loads configuration from `~/.axon/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use axon_core::BusBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.axon/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backend API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Override for the backend's base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Default model
    #[serde(default = "default_model")]
    pub model: String,

    /// Max tokens per backend response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// System prompt for images that don't set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Tool allow-list for images that don't set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    1.0
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("system_prompt", &self.system_prompt)
            .field("allowed_tools", &self.allowed_tools)
            .field("agent", &self.agent)
            .field("bus", &self.bus)
            .field("persistence", &self.persistence)
            .field("logging", &self.logging)
            .finish()
    }
}

/// Agentic loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on backend calls per user turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_tool_timeout_secs() -> u64 {
    120
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackendKind {
    #[default]
    Sync,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: BusBackendKind,

    /// Queue size for the queued backend
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long `publish` waits for queue space
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_publish_timeout_ms() -> u64 {
    5000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackendKind::default(),
            queue_capacity: default_queue_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl BusConfig {
    pub fn backend(&self) -> BusBackend {
        match self.backend {
            BusBackendKind::Sync => BusBackend::Sync,
            BusBackendKind::Queued => BusBackend::Queued {
                capacity: self.queue_capacity,
                publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    None,
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// SQLite database path (defaults to `~/.axon/sessions.db`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Default page size for history queries
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    100
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            database_url: None,
            page_size: default_page_size(),
        }
    }
}

impl PersistenceConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_url
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| AppConfig::config_dir().join("sessions.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log every bus event at debug level
    #[serde(default)]
    pub event_log: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            event_log: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.axon/config.toml).
    ///
    /// Environment variables override the file:
    /// - `AXON_API_KEY`, then `ANTHROPIC_API_KEY` (only if no key is configured)
    /// - `AXON_MODEL`, `AXON_BASE_URL`, `AXON_MAX_ITERATIONS`,
    ///   `AXON_BUS_BACKEND`, `AXON_LOG_LEVEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path, |key| std::env::var(key).ok())
    }

    /// Load from `path`, then apply overrides looked up through `env`.
    pub fn load_with_env(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = env("AXON_API_KEY").or_else(|| env("ANTHROPIC_API_KEY"));
        }
        if let Some(model) = env("AXON_MODEL") {
            self.model = model;
        }
        if let Some(url) = env("AXON_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(raw) = env("AXON_MAX_ITERATIONS") {
            self.agent.max_iterations = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("AXON_MAX_ITERATIONS is not a number: {raw}"))
            })?;
        }
        if let Some(raw) = env("AXON_BUS_BACKEND") {
            self.bus.backend = match raw.as_str() {
                "sync" => BusBackendKind::Sync,
                "queued" => BusBackendKind::Queued,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "AXON_BUS_BACKEND must be 'sync' or 'queued', got '{other}'"
                    )));
                }
            };
        }
        if let Some(level) = env("AXON_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".axon")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(1..=100_000).contains(&self.max_tokens) {
            return Err(ConfigError::ValidationError(
                "max_tokens must be between 1 and 100000".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.tool_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent.tool_timeout_secs must be at least 1".into(),
            ));
        }
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "bus.queue_capacity must be at least 1".into(),
            ));
        }
        if self.persistence.page_size == 0 {
            return Err(ConfigError::ValidationError(
                "persistence.page_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Render this configuration as TOML, with the API key redacted.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.api_key.is_some() {
            shown.api_key = Some("[REDACTED]".into());
        }
        toml::to_string_pretty(&shown).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_ms: default_request_timeout_ms(),
            system_prompt: None,
            allowed_tools: None,
            agent: AgentConfig::default(),
            bus: BusConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model, "claude-sonnet-4-20250514");
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.bus.backend, BusBackendKind::Sync);
        assert_eq!(config.persistence.backend, PersistenceBackend::None);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.bus.queue_capacity, config.bus.queue_capacity);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn sections_parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
model = "claude-3-5-haiku-latest"
allowed_tools = ["calculator"]

[agent]
max_iterations = 5

[bus]
backend = "queued"
queue_capacity = 16

[persistence]
backend = "sqlite"
database_url = "/tmp/axon-test.db"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.model, "claude-3-5-haiku-latest");
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.agent.tool_timeout_secs, 120);
        assert_eq!(
            config.bus.backend(),
            BusBackend::Queued {
                capacity: 16,
                publish_timeout: Duration::from_millis(5000)
            }
        );
        assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
        assert_eq!(
            config.persistence.database_path(),
            PathBuf::from("/tmp/axon-test.db")
        );
        assert_eq!(config.allowed_tools, Some(vec!["calculator".to_string()]));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = [").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env = env_from(&[
            ("ANTHROPIC_API_KEY", "sk-ant-fallback"),
            ("AXON_MODEL", "claude-opus-4-20250514"),
            ("AXON_MAX_ITERATIONS", "3"),
            ("AXON_BUS_BACKEND", "queued"),
        ]);
        let config = AppConfig::load_with_env(Path::new("/nonexistent/config.toml"), env).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-ant-fallback"));
        assert_eq!(config.model, "claude-opus-4-20250514");
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.bus.backend, BusBackendKind::Queued);
    }

    #[test]
    fn axon_key_wins_over_anthropic_key() {
        let env = env_from(&[("AXON_API_KEY", "primary"), ("ANTHROPIC_API_KEY", "fallback")]);
        let config = AppConfig::load_with_env(Path::new("/nonexistent/config.toml"), env).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let env = env_from(&[("AXON_BUS_BACKEND", "kafka")]);
        assert!(AppConfig::load_with_env(Path::new("/nonexistent/config.toml"), env).is_err());

        let env = env_from(&[("AXON_MAX_ITERATIONS", "0")]);
        assert!(AppConfig::load_with_env(Path::new("/nonexistent/config.toml"), env).is_err());
    }

    #[test]
    fn debug_and_rendered_toml_redact_api_key() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        assert!(!format!("{config:?}").contains("sk-secret"));
        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
