//! Message and tool-call domain types.
//!
//! These are the value objects that make up a session's conversation history:
//! the Interactor appends user messages, the Presenter appends finalized
//! assistant messages, and tool results are written back into the matching
//! [`ToolCall`] as they complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A tool invocation requested by the assistant.
///
/// A call with neither `result` nor `error` set is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the backend's tool_use id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Structured arguments
    pub arguments: serde_json::Value,

    /// Tool output once the call succeeded
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Failure description once the call failed
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            result: None,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }

    /// Record a successful outcome, clearing any earlier error.
    pub fn resolve(&mut self, result: serde_json::Value) {
        self.result = Some(result);
        self.error = None;
    }

    /// Record a failed outcome, clearing any earlier result.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.result = None;
    }
}

/// A single turn's content in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub message_id: String,

    /// Owning session
    pub session_id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// When the message was created
    pub timestamp: DateTime<Utc>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
}

impl Message {
    fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// Create a new user message.
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::System, content)
    }

    /// Attach tool calls (an empty list is stored as `None`).
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = if calls.is_empty() { None } else { Some(calls) };
        self
    }

    pub fn with_usage(mut self, input_tokens: Option<u32>, output_tokens: Option<u32>) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Look up one of this message's tool calls by id.
    pub fn tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCall> {
        self.tool_calls
            .as_mut()?
            .iter_mut()
            .find(|tc| tc.id == call_id)
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.tool_calls
            .as_deref()
            .map_or(0, |calls| calls.iter().filter(|tc| tc.is_pending()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("session_1", "Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert_eq!(msg.session_id, "session_1");
        assert!(msg.tool_calls.is_none());
    }

    #[test]
    fn empty_tool_calls_are_none() {
        let msg = Message::assistant("s", "hi").with_tool_calls(vec![]);
        assert!(msg.tool_calls.is_none());
    }

    #[test]
    fn resolving_a_call_preserves_identity() {
        let args = serde_json::json!({"expression": "2+2"});
        let mut msg = Message::assistant("s", "")
            .with_tool_calls(vec![ToolCall::new("toolu_1", "calculator", args.clone())]);
        assert_eq!(msg.pending_tool_calls(), 1);

        let call = msg.tool_call_mut("toolu_1").unwrap();
        call.resolve(serde_json::json!({"value": 4}));

        let call = &msg.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.name, "calculator");
        assert_eq!(call.arguments, args);
        assert_eq!(call.result, Some(serde_json::json!({"value": 4})));
        assert!(call.error.is_none());
        assert_eq!(msg.pending_tool_calls(), 0);
    }

    #[test]
    fn failing_a_call_clears_result() {
        let mut call = ToolCall::new("a", "b", serde_json::Value::Null);
        call.resolve(serde_json::json!(1));
        call.fail("boom");
        assert!(call.result.is_none());
        assert_eq!(call.error.as_deref(), Some("boom"));
        assert!(!call.is_pending());
    }

    #[test]
    fn role_parses_from_wire_names() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn message_serialization_uses_lowercase_role() {
        let msg = Message::user("s", "Test message");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""role":"user""#));
        assert!(!json.contains("tool_calls"));
    }
}
