//! Shared fixtures: a scripted backend and a bus recorder.

#![allow(dead_code)]

use async_trait::async_trait;
use axon_core::agent::AgentState;
use axon_core::bus::{BusConsumer, EventFilter, SubscribeOptions};
use axon_core::error::ProviderError;
use axon_core::event::{EventPayload, EventSource, EventType, SystemEvent};
use axon_core::provider::{
    BlockDelta, BlockStart, FragmentReceiver, Provider, ProviderRequest, StopReason,
    StreamFragment, Usage,
};
use axon_runtime::RuntimeAgent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One backend response.
pub enum Step {
    Reply(Vec<StreamFragment>),
    /// Start a message and never finish it
    Hang,
    Fail(ProviderError),
}

/// Replays steps in order; once they run out, repeats `fallback`.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<Vec<StreamFragment>>,
    requests: Mutex<Vec<ProviderRequest>>,
    stalled: Mutex<Vec<mpsc::Sender<Result<StreamFragment, ProviderError>>>>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
        })
    }

    pub fn repeating(reply: Vec<StreamFragment>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Some(reply),
            requests: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<FragmentReceiver, ProviderError> {
        self.requests.lock().push(request);
        let step = self.steps.lock().pop_front();
        let fragments = match step {
            Some(Step::Reply(fragments)) => fragments,
            Some(Step::Fail(e)) => return Err(e),
            Some(Step::Hang) => {
                let (tx, rx) = mpsc::channel(4);
                let _ = tx.send(Ok(message_start("msg_hang"))).await;
                self.stalled.lock().push(tx);
                return Ok(rx);
            }
            None => match &self.fallback {
                Some(fragments) => fragments.clone(),
                None => return Err(ProviderError::StreamInterrupted("script exhausted".into())),
            },
        };

        let (tx, rx) = mpsc::channel(fragments.len().max(1));
        for fragment in fragments {
            let _ = tx.send(Ok(fragment)).await;
        }
        Ok(rx)
    }
}

fn message_start(id: &str) -> StreamFragment {
    StreamFragment::MessageStart {
        id: id.into(),
        model: "scripted-model".into(),
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 1,
        }),
    }
}

fn message_end(stop_reason: StopReason) -> [StreamFragment; 2] {
    [
        StreamFragment::MessageDelta {
            stop_reason: Some(stop_reason),
            usage: Some(Usage {
                input_tokens: 0,
                output_tokens: 5,
            }),
        },
        StreamFragment::MessageStop,
    ]
}

/// A plain text answer ending the turn.
pub fn text_reply(text: &str) -> Vec<StreamFragment> {
    let mut fragments = vec![
        message_start("msg_text"),
        StreamFragment::ContentBlockStart {
            index: 0,
            block: BlockStart::Text,
        },
        StreamFragment::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta { text: text.into() },
        },
        StreamFragment::ContentBlockStop { index: 0 },
    ];
    fragments.extend(message_end(StopReason::EndTurn));
    fragments
}

/// A text answer whose stream ends before `message_stop`.
pub fn truncated_reply(text: &str) -> Vec<StreamFragment> {
    vec![
        message_start("msg_cut"),
        StreamFragment::ContentBlockStart {
            index: 0,
            block: BlockStart::Text,
        },
        StreamFragment::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta { text: text.into() },
        },
    ]
}

/// A single tool request, with its input split across two deltas.
pub fn tool_reply(call_id: &str, tool: &str, input: serde_json::Value) -> Vec<StreamFragment> {
    let json = input.to_string();
    let (head, tail) = json.split_at(json.len() / 2);
    let mut fragments = vec![
        message_start("msg_tool"),
        StreamFragment::ContentBlockStart {
            index: 0,
            block: BlockStart::ToolUse {
                id: call_id.into(),
                name: tool.into(),
            },
        },
        StreamFragment::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::InputJsonDelta {
                partial_json: head.into(),
            },
        },
        StreamFragment::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::InputJsonDelta {
                partial_json: tail.into(),
            },
        },
        StreamFragment::ContentBlockStop { index: 0 },
    ];
    fragments.extend(message_end(StopReason::ToolUse));
    fragments
}

/// Records every event on the bus.
#[derive(Clone)]
pub struct Recorder {
    events: Arc<Mutex<Vec<SystemEvent>>>,
}

impl Recorder {
    pub fn attach(consumer: &BusConsumer) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        consumer.on_with(
            EventFilter::Any,
            move |e| sink.lock().push(e.clone()),
            SubscribeOptions::new(),
        );
        Self { events }
    }

    pub fn events(&self) -> Vec<SystemEvent> {
        self.events.lock().clone()
    }

    /// Broadcast events published by `agent`.
    pub fn external(&self, agent: &RuntimeAgent) -> Vec<SystemEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.broadcastable && e.agent_id() == Some(agent.agent_id()))
            .cloned()
            .collect()
    }

    /// The agent's published state changes, in order.
    pub fn states(&self, agent: &RuntimeAgent) -> Vec<AgentState> {
        self.external(agent)
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::StateChange(data) => Some(data.state),
                _ => None,
            })
            .collect()
    }

    pub fn environment(&self) -> Vec<SystemEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.source == EventSource::Environment)
            .cloned()
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

/// Poll until `done` holds, failing the test after two seconds.
pub async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the agent has finished its turn and the backend task is gone.
pub async fn wait_settled(agent: &RuntimeAgent, recorder: &Recorder) {
    wait_for("turn to settle", || {
        !agent.is_processing()
            && !agent.state().is_busy()
            && recorder
                .states(agent)
                .last()
                .is_some_and(|s| matches!(s, AgentState::Idle | AgentState::Error))
    })
    .await;
}
