//! Receptor: backend fragments in, typed bus events out.
//!
//! The Receptor keeps a small cursor over the open content blocks so it can
//! rebuild block boundaries from a flat fragment stream. Tool input arrives as
//! JSON text split across `input_json_delta` fragments; it is parsed once when
//! its block stops.

use axon_core::bus::BusProducer;
use axon_core::event::{EventContext, EventPayload, EventSource, SystemEvent};
use axon_core::provider::{BlockDelta, BlockStart, StopReason, StreamFragment};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Correlation attached to every event the Receptor emits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceptorMeta {
    pub context: EventContext,
    pub request_id: Option<String>,
}

#[derive(Debug)]
enum OpenBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

pub struct Receptor {
    producer: BusProducer,
    meta: ReceptorMeta,
    blocks: BTreeMap<usize, OpenBlock>,
    stop_reason: Option<StopReason>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Receptor {
    pub fn new(producer: BusProducer, meta: ReceptorMeta) -> Self {
        Self {
            producer,
            meta,
            blocks: BTreeMap::new(),
            stop_reason: None,
            cancel: None,
        }
    }

    /// Stop emitting once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn meta(&self) -> &ReceptorMeta {
        &self.meta
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn emit(&self, payload: EventPayload) {
        if self.cancelled() {
            debug!(event_type = %payload.event_type(), "Dropped event from cancelled run");
            return;
        }
        let event = SystemEvent::new(EventSource::Environment, payload)
            .with_context(Some(self.meta.context.clone()))
            .with_request_id(self.meta.request_id.clone());
        self.producer.emit(event);
    }

    /// Translate one fragment, emit it, and return what was emitted.
    ///
    /// Fragments that break block structure (a delta or stop for a block that
    /// was never started) are logged and dropped.
    pub fn feed(&mut self, fragment: StreamFragment) -> Option<EventPayload> {
        let payload = match fragment {
            StreamFragment::MessageStart { id, model, usage } => {
                self.blocks.clear();
                self.stop_reason = None;
                EventPayload::MessageStart {
                    message_id: id,
                    model,
                    usage,
                }
            }
            StreamFragment::ContentBlockStart { index, block } => match block {
                BlockStart::Text => {
                    self.blocks.insert(index, OpenBlock::Text);
                    EventPayload::TextContentBlockStart { index }
                }
                BlockStart::ToolUse { id, name } => {
                    self.blocks.insert(
                        index,
                        OpenBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            json: String::new(),
                        },
                    );
                    EventPayload::ToolUseContentBlockStart {
                        index,
                        tool_call_id: id,
                        tool_name: name,
                    }
                }
            },
            StreamFragment::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(&index), delta) {
                    (Some(OpenBlock::Text), BlockDelta::TextDelta { text }) => {
                        EventPayload::TextDelta { index, text }
                    }
                    (
                        Some(OpenBlock::ToolUse { json, .. }),
                        BlockDelta::InputJsonDelta { partial_json },
                    ) => {
                        json.push_str(&partial_json);
                        EventPayload::InputJsonDelta {
                            index,
                            partial_json,
                        }
                    }
                    (block, delta) => {
                        warn!(index, open = ?block, ?delta, "Delta does not match an open block");
                        return None;
                    }
                }
            }
            StreamFragment::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some(OpenBlock::Text) => EventPayload::TextContentBlockStop { index },
                Some(OpenBlock::ToolUse { id, name, json }) => {
                    EventPayload::ToolUseContentBlockStop {
                        index,
                        input: parse_tool_input(&name, &json),
                        tool_call_id: id,
                        tool_name: name,
                    }
                }
                None => {
                    warn!(index, "Stop for a block that was never started");
                    return None;
                }
            },
            StreamFragment::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                EventPayload::MessageDelta { stop_reason, usage }
            }
            StreamFragment::MessageStop => {
                if !self.blocks.is_empty() {
                    warn!(open = self.blocks.len(), "Message stopped with blocks still open");
                    self.blocks.clear();
                }
                EventPayload::MessageStop {
                    stop_reason: self.stop_reason.take(),
                }
            }
            StreamFragment::ToolResult {
                tool_use_id,
                tool_name,
                content,
                is_error,
            } => EventPayload::ToolResult {
                tool_call_id: tool_use_id,
                tool_name,
                result: content,
                is_error,
            },
        };

        self.emit(payload.clone());
        Some(payload)
    }

    pub fn emit_interrupted(&self, reason: impl Into<String>) {
        self.emit(EventPayload::Interrupted {
            reason: reason.into(),
        });
    }

    pub fn emit_error(&self, message: impl Into<String>, code: impl Into<String>) {
        self.emit(EventPayload::ErrorReceived {
            message: message.into(),
            error_code: Some(code.into()),
        });
    }
}

/// Empty input means "no arguments". Malformed JSON is kept as a string so the
/// tool can reject it.
fn parse_tool_input(tool: &str, json: &str) -> serde_json::Value {
    if json.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    serde_json::from_str(json).unwrap_or_else(|e| {
        warn!(tool, "Malformed tool input JSON: {e}");
        serde_json::Value::String(json.to_string())
    })
}
