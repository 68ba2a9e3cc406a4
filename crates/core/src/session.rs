//! Session: one conversation's persistent state.
//!
//! A session is created when an agent is instantiated and is shared between
//! the agent's Interactor (user input) and Presenter (finalized output) behind
//! an exclusive lock. Nothing holds that lock across an `.await`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent::AgentState;
use crate::message::Message;

/// Processing state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Processing,
    WaitingForTool,
    Error,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::WaitingForTool => "waiting_for_tool",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "processing" => Ok(Self::Processing),
            "waiting_for_tool" => Ok(Self::WaitingForTool),
            "error" => Ok(Self::Error),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

impl From<AgentState> for SessionState {
    fn from(state: AgentState) -> Self {
        match state {
            AgentState::Idle | AgentState::Done => Self::Idle,
            AgentState::Thinking | AgentState::Responding | AgentState::CallingTool => {
                Self::Processing
            }
            AgentState::WaitingForTool => Self::WaitingForTool,
            AgentState::Error => Self::Error,
        }
    }
}

/// Conversation history and processing state for one agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: SessionState,

    /// Ordered conversation history
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Free-form configuration
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A session behind its exclusive lock, shared by an agent and its container.
pub type SharedSession = Arc<RwLock<Session>>;

impl Session {
    /// Create a new idle session.
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            state: SessionState::Idle,
            messages: Vec::new(),
            config: serde_json::Map::new(),
            user_id: None,
            title: None,
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }

    /// Append a message to the history.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.updated_at = Utc::now();
        }
    }

    /// Append a message, or replace the stored copy if its ID is already present.
    ///
    /// Replacing is how finished tool calls are written back into history.
    pub fn upsert(&mut self, message: Message) {
        match self
            .messages
            .iter_mut()
            .find(|m| m.message_id == message.message_id)
        {
            Some(existing) => {
                *existing = message;
                self.updated_at = Utc::now();
            }
            None => self.push(message),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
