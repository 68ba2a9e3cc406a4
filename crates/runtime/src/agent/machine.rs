//! Agent processing state machine.
//!
//! The machine does no I/O. Each input returns the payloads the agent should
//! present, in order: state changes, forwarded stream events, assembled
//! messages, and turn events. Events whose request ID does not belong to the
//! active turn are ignored, which drops late output from a cancelled run.

use super::driver::StreamEvent;
use crate::turn::TurnAccumulator;
use axon_core::agent::AgentState;
use axon_core::error::StateError;
use axon_core::event::{EventPayload, StateEventData, TurnEventData};
use axon_core::message::Message;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

struct Turn {
    turn_id: String,
    request_id: Option<String>,
    user_message_id: String,
    started: Instant,
    accumulator: TurnAccumulator,

    /// Last assistant message with tool calls still being answered
    awaiting: Option<Message>,
    assistant_message_id: Option<String>,
    input_tokens: u32,
    output_tokens: u32,
}

pub struct AgentMachine {
    agent_id: String,
    session_id: String,
    state: AgentState,
    turn: Option<Turn>,
}

fn transition(
    state: &mut AgentState,
    to: AgentState,
    tool: Option<(&str, &str)>,
    out: &mut Vec<EventPayload>,
) {
    if *state == to {
        return;
    }
    let previous = std::mem::replace(state, to);
    out.push(EventPayload::StateChange(StateEventData {
        state: to,
        previous_state: previous,
        tool_call_id: tool.map(|(id, _)| id.to_string()),
        tool_name: tool.map(|(_, name)| name.to_string()),
    }));
}

impl AgentMachine {
    pub fn new(agent_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            state: AgentState::Idle,
            turn: None,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn request_id(&self) -> Option<&str> {
        self.turn.as_ref()?.request_id.as_deref()
    }

    /// Start a turn for a user message. Fails while a turn is in progress.
    pub fn begin_turn(
        &mut self,
        user_message_id: &str,
        request_id: Option<String>,
    ) -> Result<Vec<EventPayload>, StateError> {
        if self.state.is_busy() {
            return Err(StateError::Busy {
                agent_id: self.agent_id.clone(),
                state: self.state.to_string(),
            });
        }

        let turn_id = format!("turn_{}", Uuid::new_v4().simple());
        let mut out = Vec::with_capacity(2);
        transition(&mut self.state, AgentState::Thinking, None, &mut out);
        out.push(EventPayload::TurnRequest(TurnEventData {
            turn_id: turn_id.clone(),
            user_message_id: Some(user_message_id.to_string()),
            ..Default::default()
        }));

        self.turn = Some(Turn {
            turn_id,
            request_id,
            user_message_id: user_message_id.to_string(),
            started: Instant::now(),
            accumulator: TurnAccumulator::new(),
            awaiting: None,
            assistant_message_id: None,
            input_tokens: 0,
            output_tokens: 0,
        });
        Ok(out)
    }

    /// Apply one stream event from the Driver.
    pub fn apply(&mut self, event: &StreamEvent) -> Vec<EventPayload> {
        let Self {
            session_id,
            state,
            turn,
            ..
        } = self;

        let Some(active) = turn.as_mut() else {
            debug!(event_type = %event.event_type, "No active turn; ignoring stream event");
            return Vec::new();
        };
        if active.request_id.is_some() && event.request_id != active.request_id {
            debug!(event_type = %event.event_type, "Stream event from another request; ignoring");
            return Vec::new();
        }

        active.accumulator.observe(&event.payload);
        let mut out = Vec::new();

        match &event.payload {
            EventPayload::MessageStart { .. } => {
                transition(state, AgentState::Responding, None, &mut out);
                out.push(event.payload.clone());
            }
            EventPayload::ToolUseContentBlockStart {
                tool_call_id,
                tool_name,
                ..
            } => {
                transition(
                    state,
                    AgentState::CallingTool,
                    Some((tool_call_id.as_str(), tool_name.as_str())),
                    &mut out,
                );
                out.push(event.payload.clone());
            }
            EventPayload::MessageStop { .. } => {
                out.push(event.payload.clone());

                let assistant = active.accumulator.take();
                active.input_tokens += assistant.usage.input_tokens;
                active.output_tokens += assistant.usage.output_tokens;
                let message = assistant.to_message(session_id);
                active.assistant_message_id = Some(message.message_id.clone());

                if assistant.wants_tools() {
                    active.awaiting = Some(message.clone());
                    out.push(EventPayload::AssistantMessage(message));
                    transition(state, AgentState::WaitingForTool, None, &mut out);
                } else {
                    out.push(EventPayload::AssistantMessage(message));
                    transition(state, AgentState::Done, None, &mut out);
                    out.push(EventPayload::TurnResponse(TurnEventData {
                        turn_id: active.turn_id.clone(),
                        user_message_id: Some(active.user_message_id.clone()),
                        assistant_message_id: active.assistant_message_id.clone(),
                        input_tokens: active.input_tokens,
                        output_tokens: active.output_tokens,
                        duration_ms: Some(active.started.elapsed().as_millis() as u64),
                    }));
                    transition(state, AgentState::Idle, None, &mut out);
                    *turn = None;
                }
            }
            EventPayload::ToolResult {
                tool_call_id,
                result,
                is_error,
                ..
            } => {
                out.push(event.payload.clone());
                let Some(message) = active.awaiting.as_mut() else {
                    return out;
                };
                let Some(call) = message.tool_call_mut(tool_call_id) else {
                    debug!(tool_call_id = %tool_call_id, "Tool result for an unknown call");
                    return out;
                };
                if *is_error {
                    call.fail(
                        result
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| result.to_string()),
                    );
                } else {
                    call.resolve(result.clone());
                }
                out.push(EventPayload::ToolResultMessage(message.clone()));
            }
            EventPayload::Interrupted { .. } => {
                out.push(event.payload.clone());
                transition(state, AgentState::Idle, None, &mut out);
                *turn = None;
            }
            EventPayload::ErrorReceived { .. } => {
                out.push(event.payload.clone());
                transition(state, AgentState::Error, None, &mut out);
                *turn = None;
            }
            _ => out.push(event.payload.clone()),
        }
        out
    }

    /// Abandon any turn and return to idle.
    pub fn reset(&mut self) -> Vec<EventPayload> {
        let mut out = Vec::new();
        self.turn = None;
        transition(&mut self.state, AgentState::Idle, None, &mut out);
        out
    }
}
