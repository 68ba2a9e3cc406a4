//! Runtime settings, projected from the application config.

use axon_config::AppConfig;
use axon_core::bus::BusBackend;
use std::time::Duration;

/// Settings shared by every container and agent a [`Runtime`](crate::Runtime) creates.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,

    /// Used when an image has no system prompt of its own
    pub system_prompt: Option<String>,

    /// Used when an image has no tool allow-list of its own
    pub allowed_tools: Option<Vec<String>>,

    /// Upper bound on backend calls per user turn
    pub max_iterations: u32,

    pub tool_timeout: Duration,
    pub bus: BusBackend,

    /// Log every bus event at debug level
    pub event_log: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 4096,
            temperature: None,
            system_prompt: None,
            allowed_tools: None,
            max_iterations: 20,
            tool_timeout: Duration::from_secs(120),
            bus: BusBackend::Sync,
            event_log: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_bus(mut self, backend: BusBackend) -> Self {
        self.bus = backend;
        self
    }

    pub fn with_event_log(mut self, enabled: bool) -> Self {
        self.event_log = enabled;
        self
    }
}

impl From<&AppConfig> for RuntimeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: Some(config.temperature),
            system_prompt: config.system_prompt.clone(),
            allowed_tools: config.allowed_tools.clone(),
            max_iterations: config.agent.max_iterations,
            tool_timeout: config.agent.tool_timeout(),
            bus: config.bus.backend(),
            event_log: config.logging.event_log,
        }
    }
}
