//! Assembly of one backend response from its stream events.
//!
//! Both sides of the bus need the finished response: the Effector appends it
//! to the conversation buffer it sends back to the backend, and the agent
//! turns it into an assistant [`Message`] for the session.

use axon_core::event::EventPayload;
use axon_core::message::{Message, Role, ToolCall};
use axon_core::provider::{ContentPart, ProviderMessage, StopReason, Usage};
use std::collections::BTreeMap;

/// A tool invocation requested by the backend, input fully parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone)]
enum Block {
    Text(String),
    ToolUse(ToolUse),
}

/// Collects the events of a single backend message.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    blocks: BTreeMap<usize, Block>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, payload: &EventPayload) {
        match payload {
            EventPayload::MessageStart { usage, .. } => {
                if let Some(usage) = usage {
                    self.usage.input_tokens = usage.input_tokens;
                    self.usage.output_tokens = usage.output_tokens;
                }
            }
            EventPayload::TextContentBlockStart { index } => {
                self.blocks.entry(*index).or_insert_with(|| Block::Text(String::new()));
            }
            EventPayload::TextDelta { index, text } => {
                if let Block::Text(buffer) = self
                    .blocks
                    .entry(*index)
                    .or_insert_with(|| Block::Text(String::new()))
                {
                    buffer.push_str(text);
                }
            }
            EventPayload::ToolUseContentBlockStop {
                index,
                tool_call_id,
                tool_name,
                input,
            } => {
                self.blocks.insert(
                    *index,
                    Block::ToolUse(ToolUse {
                        id: tool_call_id.clone(),
                        name: tool_name.clone(),
                        input: input.clone(),
                    }),
                );
            }
            EventPayload::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = *stop_reason;
                }
                if let Some(usage) = usage {
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                    self.usage.output_tokens = usage.output_tokens;
                }
            }
            EventPayload::MessageStop {
                stop_reason: Some(reason),
            } => self.stop_reason = Some(*reason),
            _ => {}
        }
    }

    /// Finish the message and reset for the next one.
    pub fn take(&mut self) -> AssistantTurn {
        let blocks = std::mem::take(&mut self.blocks);
        let mut turn = AssistantTurn {
            text: String::new(),
            tool_uses: Vec::new(),
            content: Vec::with_capacity(blocks.len()),
            stop_reason: self.stop_reason.take(),
            usage: std::mem::take(&mut self.usage),
        };
        for block in blocks.into_values() {
            match block {
                Block::Text(text) if text.is_empty() => {}
                Block::Text(text) => {
                    turn.text.push_str(&text);
                    turn.content.push(ContentPart::Text { text });
                }
                Block::ToolUse(tool_use) => {
                    turn.content.push(ContentPart::ToolUse {
                        id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        input: tool_use.input.clone(),
                    });
                    turn.tool_uses.push(tool_use);
                }
            }
        }
        turn
    }
}

/// One finished backend message.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTurn {
    /// Concatenated text blocks
    pub text: String,
    pub tool_uses: Vec<ToolUse>,

    /// Blocks in index order, as they go back to the backend
    pub content: Vec<ContentPart>,

    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

impl AssistantTurn {
    /// Whether the backend is waiting on tool results.
    pub fn wants_tools(&self) -> bool {
        self.stop_reason == Some(StopReason::ToolUse) && !self.tool_uses.is_empty()
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        ProviderMessage {
            role: Role::Assistant,
            content: self.content.clone(),
        }
    }

    /// The session-history form, with every tool call pending.
    pub fn to_message(&self, session_id: &str) -> Message {
        let calls = self
            .tool_uses
            .iter()
            .map(|t| ToolCall::new(&t.id, &t.name, t.input.clone()))
            .collect();
        Message::assistant(session_id, &self.text)
            .with_tool_calls(calls)
            .with_usage(Some(self.usage.input_tokens), Some(self.usage.output_tokens))
    }
}
