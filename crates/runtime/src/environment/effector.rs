//! Effector: runs the agentic loop for one agent.
//!
//! On `user_message` the Effector spawns a task that streams a backend
//! response through the [`Receptor`], executes any requested tools, feeds
//! their results back, and calls the backend again until it finishes or the
//! iteration limit is reached. On `interrupt` the task is aborted.

use super::receptor::{Receptor, ReceptorMeta};
use crate::turn::{ToolUse, TurnAccumulator};
use axon_core::bus::{BusConsumer, BusProducer, SubscribeOptions, Unsubscribe};
use axon_core::error::{ProviderError, ToolError};
use axon_core::event::{EventPayload, EventType, SystemEvent};
use axon_core::message::Role;
use axon_core::provider::{
    ContentPart, Provider, ProviderMessage, ProviderRequest, StreamFragment, ToolDefinition,
};
use axon_core::tool::ToolExecutor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-agent settings for the agentic loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_iterations: u32,
    pub tool_timeout: Duration,
    pub resume_token: Option<String>,
}

enum LoopError {
    Provider(ProviderError),
    IterationLimit(u32),
}

impl From<ProviderError> for LoopError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

struct Run {
    id: u64,
    meta: ReceptorMeta,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Run {
    fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.task.abort();
    }
}

struct Shared {
    agent_id: String,
    provider: Arc<dyn Provider>,
    executor: Arc<dyn ToolExecutor>,
    tools: Vec<ToolDefinition>,
    producer: BusProducer,
    settings: LoopSettings,

    /// Conversation as the backend sees it
    history: Mutex<Vec<ProviderMessage>>,
    inflight: Mutex<Option<Run>>,
    next_run: AtomicU64,
}

pub struct Effector {
    shared: Arc<Shared>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl Effector {
    pub fn new(
        agent_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
        producer: BusProducer,
        settings: LoopSettings,
    ) -> Self {
        let tools = executor.definitions();
        Self {
            shared: Arc::new(Shared {
                agent_id: agent_id.into(),
                provider,
                executor,
                tools,
                producer,
                settings,
                history: Mutex::new(Vec::new()),
                inflight: Mutex::new(None),
                next_run: AtomicU64::new(1),
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to this agent's `user_message` and `interrupt` events.
    pub fn connect(&self, consumer: &BusConsumer) {
        let agent_id = self.shared.agent_id.clone();

        let weak = Arc::downgrade(&self.shared);
        let on_message = consumer.on_with(
            EventType::UserMessage,
            move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.start_run(event);
                }
            },
            SubscribeOptions::for_agent(agent_id.clone()),
        );

        let weak = Arc::downgrade(&self.shared);
        let on_interrupt = consumer.on_with(
            EventType::Interrupt,
            move |event| {
                let (Some(shared), EventPayload::Interrupt { reason }) =
                    (weak.upgrade(), &event.payload)
                else {
                    return;
                };
                shared.interrupt(reason.as_deref().unwrap_or("interrupted"));
            },
            SubscribeOptions::for_agent(agent_id),
        );

        self.subscriptions.lock().extend([on_message, on_interrupt]);
    }

    /// Cancel the in-flight run, if any, and report it as interrupted.
    pub fn interrupt(&self, reason: &str) {
        self.shared.interrupt(reason);
    }

    pub fn is_running(&self) -> bool {
        self.shared.inflight.lock().is_some()
    }

    /// Forget the conversation sent to the backend.
    pub fn clear_history(&self) {
        self.shared.history.lock().clear();
        debug!(agent_id = %self.shared.agent_id, "Cleared conversation buffer");
    }

    pub fn history_len(&self) -> usize {
        self.shared.history.lock().len()
    }

    /// Unsubscribe and silently cancel any in-flight run.
    pub fn dispose(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(run) = self.shared.inflight.lock().take() {
            run.cancel();
        }
    }
}

impl Shared {
    fn start_run(self: &Arc<Self>, event: &SystemEvent) {
        let EventPayload::UserMessage(message) = &event.payload else {
            return;
        };
        let meta = ReceptorMeta {
            context: event.context.clone().unwrap_or_default(),
            request_id: event.request_id.clone(),
        };

        let Ok(handle) = Handle::try_current() else {
            error!(agent_id = %self.agent_id, "No Tokio runtime available for the agentic loop");
            Receptor::new(self.producer.clone(), meta)
                .emit_error("No async runtime available to process the message", "no_runtime");
            return;
        };

        let mut inflight = self.inflight.lock();
        if let Some(previous) = inflight.take() {
            warn!(agent_id = %self.agent_id, "New message while a run is in flight; cancelling it");
            previous.cancel();
        }
        self.history
            .lock()
            .push(ProviderMessage::user_text(&message.content));

        let cancel = Arc::new(AtomicBool::new(false));
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let task = handle.spawn(run_loop(self.clone(), meta.clone(), cancel.clone(), id));
        *inflight = Some(Run {
            id,
            meta,
            cancel,
            task,
        });
    }

    fn interrupt(&self, reason: &str) {
        let run = self.inflight.lock().take();
        match run {
            Some(run) => {
                run.cancel();
                debug!(agent_id = %self.agent_id, reason, "Cancelled in-flight run");
                Receptor::new(self.producer.clone(), run.meta).emit_interrupted(reason);
            }
            None => debug!(agent_id = %self.agent_id, "Interrupt with nothing in flight"),
        }
    }

    fn finish_run(&self, id: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.as_ref().is_some_and(|run| run.id == id) {
            *inflight = None;
        }
    }

    fn request(&self) -> ProviderRequest {
        ProviderRequest {
            model: self.settings.model.clone(),
            system: self.settings.system_prompt.clone(),
            messages: self.history.lock().clone(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            tools: self.tools.clone(),
            resume_token: self.settings.resume_token.clone(),
        }
    }

    async fn agentic_loop(
        &self,
        receptor: &mut Receptor,
        cancel: &AtomicBool,
    ) -> Result<u32, LoopError> {
        let max = self.settings.max_iterations;
        for iteration in 1..=max {
            debug!(agent_id = %self.agent_id, iteration, "Agentic loop iteration");

            let mut fragments = self.provider.stream(self.request()).await?;
            let mut accumulator = TurnAccumulator::new();
            let mut stopped = false;
            while let Some(fragment) = fragments.recv().await {
                let fragment = fragment?;
                stopped |= matches!(fragment, StreamFragment::MessageStop);
                if let Some(payload) = receptor.feed(fragment) {
                    accumulator.observe(&payload);
                }
            }

            let turn = accumulator.take();
            if cancel.load(Ordering::Acquire) {
                return Ok(iteration);
            }
            if !stopped {
                return Err(ProviderError::StreamInterrupted(
                    "backend stream closed before message_stop".into(),
                )
                .into());
            }
            if !turn.wants_tools() {
                if !turn.content.is_empty() {
                    self.history.lock().push(turn.to_provider_message());
                }
                return Ok(iteration);
            }

            let mut results = Vec::with_capacity(turn.tool_uses.len());
            for tool_use in &turn.tool_uses {
                let (content, is_error) = self.execute_tool(tool_use).await;
                receptor.feed(StreamFragment::ToolResult {
                    tool_use_id: tool_use.id.clone(),
                    tool_name: tool_use.name.clone(),
                    content: content.clone(),
                    is_error,
                });
                results.push(ContentPart::ToolResult {
                    tool_use_id: tool_use.id.clone(),
                    content,
                    is_error,
                });
            }

            if cancel.load(Ordering::Acquire) {
                return Ok(iteration);
            }
            let mut history = self.history.lock();
            history.push(turn.to_provider_message());
            history.push(ProviderMessage {
                role: Role::User,
                content: results,
            });
        }
        Err(LoopError::IterationLimit(max))
    }

    /// Run one tool. Failures become an error-flagged result for the backend.
    async fn execute_tool(&self, tool_use: &ToolUse) -> (serde_json::Value, bool) {
        let started = Instant::now();
        let timeout = self.settings.tool_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            self.executor.execute(&tool_use.name, tool_use.input.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ToolError::Timeout {
                tool_name: tool_use.name.clone(),
                timeout_secs: timeout.as_secs(),
            })
        });
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                debug!(
                    agent_id = %self.agent_id,
                    tool = %tool_use.name,
                    duration_ms,
                    "Tool succeeded"
                );
                (value, false)
            }
            Err(e) => {
                warn!(
                    agent_id = %self.agent_id,
                    tool = %tool_use.name,
                    duration_ms,
                    "Tool failed: {e}"
                );
                (serde_json::Value::String(e.to_string()), true)
            }
        }
    }
}

async fn run_loop(shared: Arc<Shared>, meta: ReceptorMeta, cancel: Arc<AtomicBool>, id: u64) {
    let mut receptor =
        Receptor::new(shared.producer.clone(), meta).with_cancel(cancel.clone());

    match shared.agentic_loop(&mut receptor, &cancel).await {
        Ok(iterations) => {
            info!(agent_id = %shared.agent_id, iterations, "Agentic loop finished");
        }
        Err(LoopError::Provider(e)) => {
            warn!(agent_id = %shared.agent_id, code = e.code(), "Backend call failed: {e}");
            receptor.emit_error(e.to_string(), e.code());
        }
        Err(LoopError::IterationLimit(max)) => {
            warn!(
                agent_id = %shared.agent_id,
                max_iterations = max,
                "Agentic loop hit its iteration limit"
            );
            receptor.emit_error(
                format!("Stopped after {max} backend calls without a final answer"),
                "max_iterations_exceeded",
            );
        }
    }
    shared.finish_run(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axon_core::bus::SystemBus;
    use axon_core::event::{EventContext, EventSource};
    use axon_core::message::Message;
    use axon_core::provider::{BlockDelta, BlockStart, FragmentReceiver, StopReason};
    use axon_core::tool::ToolRegistry;
    use tokio::sync::mpsc;

    /// Replies with one fixed text answer to every request.
    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn stream(
            &self,
            request: ProviderRequest,
        ) -> Result<FragmentReceiver, ProviderError> {
            let text = request.messages.last().map(|m| m.text()).unwrap_or_default();
            let (tx, rx) = mpsc::channel(16);
            let script = vec![
                StreamFragment::MessageStart {
                    id: "msg".into(),
                    model: request.model,
                    usage: None,
                },
                StreamFragment::ContentBlockStart {
                    index: 0,
                    block: BlockStart::Text,
                },
                StreamFragment::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::TextDelta { text },
                },
                StreamFragment::ContentBlockStop { index: 0 },
                StreamFragment::MessageDelta {
                    stop_reason: Some(StopReason::EndTurn),
                    usage: None,
                },
                StreamFragment::MessageStop,
            ];
            for fragment in script {
                let _ = tx.send(Ok(fragment)).await;
            }
            Ok(rx)
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            model: "test".into(),
            system_prompt: None,
            max_tokens: 256,
            temperature: None,
            max_iterations: 3,
            tool_timeout: Duration::from_secs(5),
            resume_token: None,
        }
    }

    fn user_message(agent: &str, text: &str) -> SystemEvent {
        SystemEvent::new(EventSource::Agent, EventPayload::UserMessage(Message::user("s1", text)))
            .with_context(Some(EventContext::for_agent(agent, "s1")))
            .with_request_id(Some("req_1".into()))
    }

    async fn wait_idle(effector: &Effector) {
        for _ in 0..200 {
            if !effector.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("effector never went idle");
    }

    #[tokio::test]
    async fn buffers_both_sides_of_the_conversation() {
        let bus = SystemBus::new();
        let effector = Effector::new(
            "agent_1",
            Arc::new(EchoProvider),
            Arc::new(ToolRegistry::new()),
            bus.as_producer(),
            settings(),
        );
        effector.connect(&bus.as_consumer());

        bus.emit(user_message("agent_1", "hello"));
        wait_idle(&effector).await;
        assert_eq!(effector.history_len(), 2);

        effector.clear_history();
        assert_eq!(effector.history_len(), 0);
    }

    #[tokio::test]
    async fn ignores_other_agents() {
        let bus = SystemBus::new();
        let effector = Effector::new(
            "agent_1",
            Arc::new(EchoProvider),
            Arc::new(ToolRegistry::new()),
            bus.as_producer(),
            settings(),
        );
        effector.connect(&bus.as_consumer());

        bus.emit(user_message("agent_2", "hello"));
        assert!(!effector.is_running());
        assert_eq!(effector.history_len(), 0);
    }

    #[tokio::test]
    async fn dispose_unsubscribes() {
        let bus = SystemBus::new();
        let effector = Effector::new(
            "agent_1",
            Arc::new(EchoProvider),
            Arc::new(ToolRegistry::new()),
            bus.as_producer(),
            settings(),
        );
        effector.connect(&bus.as_consumer());
        assert_eq!(bus.subscription_count(), 2);

        effector.dispose();
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn no_runtime_is_reported_on_the_bus() {
        let bus = SystemBus::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        bus.on(EventType::ErrorReceived, move |e| {
            if let EventPayload::ErrorReceived { error_code, .. } = &e.payload {
                sink.lock().push(error_code.clone());
            }
        });

        let effector = Effector::new(
            "agent_1",
            Arc::new(EchoProvider),
            Arc::new(ToolRegistry::new()),
            bus.as_producer(),
            settings(),
        );
        effector.connect(&bus.as_consumer());
        bus.emit(user_message("agent_1", "hello"));

        assert_eq!(errors.lock().as_slice(), &[Some("no_runtime".to_string())]);
        assert!(!effector.is_running());
    }
}
