//! System events: the universal message unit on the bus.
//!
//! Every event carries a closed, tagged [`EventPayload`]; its [`EventType`]
//! is derived from the payload, so a type tag and its data can never disagree.
//! Classification into categories and intents is an exhaustive match, so a new
//! event kind cannot be added without deciding where it belongs.
//!
//! Serialized form (one JSON object per event):
//!
//! ```json
//! {"type":"text_delta","data":{"index":0,"text":"4"},"timestamp":1718000000000,
//!  "source":"environment","category":"stream","intent":"notification",
//!  "context":{"agentId":"agent_1","sessionId":"session_1"},"requestId":"req_1",
//!  "broadcastable":false}
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentLifecycle, AgentState};
use crate::message::Message;
use crate::provider::{StopReason, Usage};

/// Which layer produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Environment,
    Agent,
    Container,
    Session,
    Command,
    System,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::Agent => "agent",
            Self::Container => "container",
            Self::Session => "session",
            Self::Command => "command",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Stream,
    State,
    Message,
    Turn,
    Lifecycle,
    Request,
    Response,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::State => "state",
            Self::Message => "message",
            Self::Turn => "turn",
            Self::Lifecycle => "lifecycle",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIntent {
    Notification,
    Request,
    Result,
    Error,
}

/// Correlation identifiers attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventContext {
    /// Context scoped to one agent and its session.
    pub fn for_agent(agent_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }
}

/// Payload of a `state_change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEventData {
    pub state: AgentState,
    pub previous_state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Payload of `turn_request` / `turn_response` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnEventData {
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Payload of an `agent_lifecycle` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEventData {
    pub lifecycle: AgentLifecycle,
    pub previous: AgentLifecycle,
}

/// Typed event data. The variant name is the event's `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // --- Stream layer (environment) ---
    MessageStart {
        message_id: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
    },
    TextContentBlockStart {
        index: usize,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    TextContentBlockStop {
        index: usize,
    },
    ToolUseContentBlockStart {
        index: usize,
        tool_call_id: String,
        tool_name: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    ToolUseContentBlockStop {
        index: usize,
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    Interrupted {
        reason: String,
    },
    ErrorReceived {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },

    // --- Message layer ---
    UserMessage(Message),
    AssistantMessage(Message),
    ToolResultMessage(Message),

    // --- Requests ---
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // --- State / turn / lifecycle ---
    StateChange(StateEventData),
    TurnRequest(TurnEventData),
    TurnResponse(TurnEventData),
    AgentLifecycle(LifecycleEventData),
}

/// Payload-free event type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageStart,
    MessageDelta,
    MessageStop,
    TextContentBlockStart,
    TextDelta,
    TextContentBlockStop,
    ToolUseContentBlockStart,
    InputJsonDelta,
    ToolUseContentBlockStop,
    ToolResult,
    Interrupted,
    ErrorReceived,
    UserMessage,
    AssistantMessage,
    ToolResultMessage,
    Interrupt,
    StateChange,
    TurnRequest,
    TurnResponse,
    AgentLifecycle,
}

impl EventType {
    /// Stream-layer events an agent's Driver accepts from the environment.
    pub const DRIVEABLE: &'static [EventType] = &[
        EventType::MessageStart,
        EventType::MessageDelta,
        EventType::MessageStop,
        EventType::TextContentBlockStart,
        EventType::TextDelta,
        EventType::TextContentBlockStop,
        EventType::ToolUseContentBlockStart,
        EventType::ToolUseContentBlockStop,
        EventType::ToolResult,
        EventType::Interrupted,
        EventType::ErrorReceived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::MessageDelta => "message_delta",
            Self::MessageStop => "message_stop",
            Self::TextContentBlockStart => "text_content_block_start",
            Self::TextDelta => "text_delta",
            Self::TextContentBlockStop => "text_content_block_stop",
            Self::ToolUseContentBlockStart => "tool_use_content_block_start",
            Self::InputJsonDelta => "input_json_delta",
            Self::ToolUseContentBlockStop => "tool_use_content_block_stop",
            Self::ToolResult => "tool_result",
            Self::Interrupted => "interrupted",
            Self::ErrorReceived => "error_received",
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::ToolResultMessage => "tool_result_message",
            Self::Interrupt => "interrupt",
            Self::StateChange => "state_change",
            Self::TurnRequest => "turn_request",
            Self::TurnResponse => "turn_response",
            Self::AgentLifecycle => "agent_lifecycle",
        }
    }

    pub fn is_driveable(&self) -> bool {
        Self::DRIVEABLE.contains(self)
    }

    /// Four-layer classification used when an agent presents an event:
    /// message and turn types are listed, `*_delta`/`*_start`/`*_stop` are
    /// stream, everything else is state.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::UserMessage | Self::AssistantMessage | Self::ToolResultMessage => {
                EventCategory::Message
            }
            Self::TurnRequest | Self::TurnResponse => EventCategory::Turn,
            Self::MessageStart
            | Self::MessageDelta
            | Self::MessageStop
            | Self::TextContentBlockStart
            | Self::TextDelta
            | Self::TextContentBlockStop
            | Self::ToolUseContentBlockStart
            | Self::InputJsonDelta
            | Self::ToolUseContentBlockStop => EventCategory::Stream,
            Self::Interrupt => EventCategory::Request,
            Self::AgentLifecycle => EventCategory::Lifecycle,
            Self::ToolResult | Self::Interrupted | Self::ErrorReceived | Self::StateChange => {
                EventCategory::State
            }
        }
    }

    pub fn intent(&self) -> EventIntent {
        match self {
            Self::ErrorReceived => EventIntent::Error,
            Self::Interrupt => EventIntent::Request,
            Self::ToolResult | Self::ToolResultMessage | Self::TurnResponse => EventIntent::Result,
            _ => EventIntent::Notification,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::MessageStart { .. } => EventType::MessageStart,
            Self::MessageDelta { .. } => EventType::MessageDelta,
            Self::MessageStop { .. } => EventType::MessageStop,
            Self::TextContentBlockStart { .. } => EventType::TextContentBlockStart,
            Self::TextDelta { .. } => EventType::TextDelta,
            Self::TextContentBlockStop { .. } => EventType::TextContentBlockStop,
            Self::ToolUseContentBlockStart { .. } => EventType::ToolUseContentBlockStart,
            Self::InputJsonDelta { .. } => EventType::InputJsonDelta,
            Self::ToolUseContentBlockStop { .. } => EventType::ToolUseContentBlockStop,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::Interrupted { .. } => EventType::Interrupted,
            Self::ErrorReceived { .. } => EventType::ErrorReceived,
            Self::UserMessage(_) => EventType::UserMessage,
            Self::AssistantMessage(_) => EventType::AssistantMessage,
            Self::ToolResultMessage(_) => EventType::ToolResultMessage,
            Self::Interrupt { .. } => EventType::Interrupt,
            Self::StateChange(_) => EventType::StateChange,
            Self::TurnRequest(_) => EventType::TurnRequest,
            Self::TurnResponse(_) => EventType::TurnResponse,
            Self::AgentLifecycle(_) => EventType::AgentLifecycle,
        }
    }

    /// The conversation message carried by message-layer payloads.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::UserMessage(m) | Self::AssistantMessage(m) | Self::ToolResultMessage(m) => {
                Some(m)
            }
            _ => None,
        }
    }
}

/// An event on the system bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    #[serde(flatten)]
    pub payload: EventPayload,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    pub source: EventSource,
    pub category: EventCategory,
    pub intent: EventIntent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,

    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Whether external subscribers should see this event
    #[serde(default)]
    pub broadcastable: bool,
}

impl SystemEvent {
    /// Build an event stamped now, classified from its payload type.
    pub fn new(source: EventSource, payload: EventPayload) -> Self {
        let event_type = payload.event_type();
        Self {
            payload,
            timestamp: Utc::now().timestamp_millis(),
            source,
            category: event_type.category(),
            intent: event_type.intent(),
            context: None,
            request_id: None,
            broadcastable: false,
        }
    }

    pub fn with_context(mut self, context: Option<EventContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_category(mut self, category: EventCategory) -> Self {
        self.category = category;
        self
    }

    pub fn broadcastable(mut self, broadcastable: bool) -> Self {
        self.broadcastable = broadcastable;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.context.as_ref()?.agent_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.context.as_ref()?.session_id.as_deref()
    }
}
