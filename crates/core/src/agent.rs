//! Agent definition and state types.
//!
//! An [`ImageRecord`] is the durable configuration an agent is built from;
//! [`AgentLifecycle`] tracks whether the live instance may accept work and
//! [`AgentState`] tracks what it is doing right now.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable, reusable agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Unique image ID
    pub image_id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// System prompt sent with every backend call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Model override (falls back to the runtime's model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Tools this image may call. `None` means every registered tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,

    /// Backend session to resume, if the backend supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl ImageRecord {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            name: String::new(),
            system_prompt: None,
            model: None,
            allowed_tools: None,
            resume_token: None,
        }
    }

    /// An image with a freshly generated ID.
    pub fn generated() -> Self {
        Self::new(format!("image_{}", Uuid::new_v4().simple()))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }
}

/// Lifecycle of a live agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    #[default]
    Initializing,
    Running,
    Stopped,
    Destroyed,
}

impl AgentLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for AgentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of an agent, driven by stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Thinking,
    Responding,
    CallingTool,
    WaitingForTool,
    Done,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Responding => "responding",
            Self::CallingTool => "calling_tool",
            Self::WaitingForTool => "waiting_for_tool",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Whether a turn is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Thinking | Self::Responding | Self::CallingTool | Self::WaitingForTool
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_state_starts_idle() {
        let state = AgentState::default();
        assert_eq!(state, AgentState::Idle);
        assert!(!state.is_busy());
    }

    #[test]
    fn busy_states() {
        assert!(AgentState::Thinking.is_busy());
        assert!(AgentState::WaitingForTool.is_busy());
        assert!(!AgentState::Done.is_busy());
        assert!(!AgentState::Error.is_busy());
    }

    #[test]
    fn agent_state_serializes_snake_case() {
        let json = serde_json::to_string(&AgentState::CallingTool).unwrap();
        assert_eq!(json, r#""calling_tool""#);
    }

    #[test]
    fn image_builder() {
        let image = ImageRecord::new("img")
            .with_system_prompt("Be terse.")
            .with_allowed_tools(["calculator"]);
        assert_eq!(image.system_prompt.as_deref(), Some("Be terse."));
        assert_eq!(image.allowed_tools, Some(vec!["calculator".to_string()]));
        assert!(image.model.is_none());
    }

    #[test]
    fn generated_images_are_unique() {
        assert_ne!(ImageRecord::generated().image_id, ImageRecord::generated().image_id);
    }
}
