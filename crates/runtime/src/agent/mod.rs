//! RuntimeAgent: one live conversation.
//!
//! An agent is assembled from four parts that only meet on the bus:
//! - [`Interactor`](interactor::Interactor) publishes user input
//! - [`Effector`] runs the agentic loop against the backend
//! - [`Driver`](driver::Driver) admits the resulting stream events
//! - [`Presenter`](presenter::Presenter) republishes output and updates the session
//!
//! Between Driver and Presenter sits the [`AgentMachine`](machine::AgentMachine),
//! which tracks processing state and assembles messages.

pub mod driver;
pub mod interactor;
pub mod machine;
pub mod presenter;

use crate::environment::{Effector, LoopSettings};
use axon_core::agent::{AgentLifecycle, AgentState, ImageRecord};
use axon_core::bus::SystemBus;
use axon_core::error::{Error, StateError};
use axon_core::event::{EventContext, EventPayload, LifecycleEventData};
use axon_core::message::Message;
use axon_core::provider::Provider;
use axon_core::session::SharedSession;
use axon_core::tool::ToolExecutor;
use driver::{Driver, StreamEvent};
use interactor::Interactor;
use machine::AgentMachine;
use parking_lot::Mutex;
use presenter::Presenter;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything needed to build an agent.
pub struct AgentSetup {
    pub agent_id: String,
    pub image: ImageRecord,
    pub container_id: Option<String>,
    pub session: SharedSession,
    pub settings: LoopSettings,
}

struct AgentInner {
    agent_id: String,
    image_id: String,
    session_id: String,
    session: SharedSession,
    lifecycle: Mutex<AgentLifecycle>,
    machine: Mutex<AgentMachine>,
    interactor: Interactor,
    driver: Driver,
    presenter: Presenter,
    effector: Effector,
}

/// Handle to a live agent. Clones share the same agent.
#[derive(Clone)]
pub struct RuntimeAgent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for RuntimeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeAgent")
            .field("agent_id", &self.inner.agent_id)
            .field("image_id", &self.inner.image_id)
            .field("lifecycle", &self.lifecycle())
            .field("state", &self.state())
            .finish()
    }
}

impl RuntimeAgent {
    /// Build an agent and connect it to `bus`. The agent starts `running`;
    /// call [`announce`](Self::announce) to publish that.
    pub fn new(
        setup: AgentSetup,
        bus: &SystemBus,
        provider: Arc<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let session_id = setup.session.read().session_id.clone();
        let mut context = EventContext::for_agent(&setup.agent_id, &session_id)
            .with_image(&setup.image.image_id);
        if let Some(container_id) = &setup.container_id {
            context = context.with_container(container_id);
        }

        let producer = bus.as_producer();
        let inner = Arc::new(AgentInner {
            machine: Mutex::new(AgentMachine::new(&setup.agent_id, &session_id)),
            interactor: Interactor::new(producer.clone(), context.clone()),
            driver: Driver::new(&setup.agent_id),
            presenter: Presenter::new(producer.clone(), context, setup.session.clone()),
            effector: Effector::new(&setup.agent_id, provider, executor, producer, setup.settings),
            lifecycle: Mutex::new(AgentLifecycle::Running),
            agent_id: setup.agent_id,
            image_id: setup.image.image_id,
            session_id,
            session: setup.session,
        });

        let consumer = bus.as_consumer();
        inner.effector.connect(&consumer);
        let weak = Arc::downgrade(&inner);
        inner.driver.connect(&consumer, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.drive(event);
            }
        });

        info!(agent_id = %inner.agent_id, image_id = %inner.image_id, "Agent created");
        Self { inner }
    }

    /// Publish the `initializing -> running` lifecycle event.
    pub fn announce(&self) {
        self.inner
            .present_lifecycle(AgentLifecycle::Running, AgentLifecycle::Initializing);
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn image_id(&self) -> &str {
        &self.inner.image_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn session(&self) -> SharedSession {
        self.inner.session.clone()
    }

    pub fn lifecycle(&self) -> AgentLifecycle {
        *self.inner.lifecycle.lock()
    }

    pub fn state(&self) -> AgentState {
        self.inner.machine.lock().state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle() == AgentLifecycle::Destroyed
    }

    /// Whether a backend call or tool run is in flight.
    pub fn is_processing(&self) -> bool {
        self.inner.effector.is_running()
    }

    /// Submit user input. Returns the new message's ID; the response arrives
    /// on the bus.
    pub fn receive(&self, content: impl Into<String>) -> Result<String, Error> {
        self.receive_with(content, None)
    }

    /// Like [`receive`](Self::receive), correlating events with `request_id`.
    pub fn receive_with(
        &self,
        content: impl Into<String>,
        request_id: Option<String>,
    ) -> Result<String, Error> {
        let inner = &self.inner;
        inner.ensure_running("receive")?;

        let message = Message::user(&inner.session_id, content);
        let request_id = request_id.unwrap_or_else(|| format!("req_{}", Uuid::new_v4().simple()));
        let outputs = inner
            .machine
            .lock()
            .begin_turn(&message.message_id, Some(request_id.clone()))?;

        inner.session.write().push(message.clone());
        inner.presenter.present_all(outputs, Some(&request_id));
        debug!(agent_id = %inner.agent_id, request_id = %request_id, "Received user message");

        let message_id = message.message_id.clone();
        inner.interactor.send(message, request_id);
        Ok(message_id)
    }

    /// Ask the Effector to cancel the in-flight run. A no-op when idle.
    ///
    /// If nothing is in flight but the agent still reports a busy state, the
    /// turn is abandoned and the agent returns to idle.
    pub fn interrupt(&self) -> Result<(), Error> {
        self.interrupt_with(None, None)
    }

    pub fn interrupt_with(
        &self,
        reason: Option<String>,
        request_id: Option<String>,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let stale = !inner.effector.is_running() && inner.machine.lock().state().is_busy();
        inner.interactor.interrupt(reason, request_id);

        if stale {
            warn!(agent_id = %inner.agent_id, "Abandoning a turn with no run in flight");
            let outputs = inner.machine.lock().reset();
            inner.presenter.present_all(outputs, None);
        }
        Ok(())
    }

    /// `running -> stopped`. Cancels in-flight work; the session is kept.
    pub fn stop(&self) -> Result<(), Error> {
        self.inner.swap_lifecycle("stop", AgentLifecycle::Running, AgentLifecycle::Stopped)?;
        self.inner.effector.interrupt("agent stopped");
        self.inner
            .present_lifecycle(AgentLifecycle::Stopped, AgentLifecycle::Running);
        info!(agent_id = %self.inner.agent_id, "Agent stopped");
        Ok(())
    }

    /// `stopped -> running`.
    pub fn resume(&self) -> Result<(), Error> {
        self.inner.swap_lifecycle("resume", AgentLifecycle::Stopped, AgentLifecycle::Running)?;
        self.inner
            .present_lifecycle(AgentLifecycle::Running, AgentLifecycle::Stopped);
        info!(agent_id = %self.inner.agent_id, "Agent resumed");
        Ok(())
    }

    /// Release the agent's subscriptions and close its session. Final.
    pub fn destroy(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let previous = {
            let mut lifecycle = inner.lifecycle.lock();
            if *lifecycle == AgentLifecycle::Destroyed {
                return Err(StateError::AgentDestroyed(inner.agent_id.clone()).into());
            }
            std::mem::replace(&mut *lifecycle, AgentLifecycle::Destroyed)
        };

        inner.effector.dispose();
        inner.driver.disconnect();
        let outputs = inner.machine.lock().reset();
        inner.presenter.present_all(outputs, None);
        inner.presenter.close_session();
        inner.present_lifecycle(AgentLifecycle::Destroyed, previous);
        info!(agent_id = %inner.agent_id, "Agent destroyed");
        Ok(())
    }

    /// Forget the conversation the backend sees. Session history is kept.
    pub fn clear_history(&self) -> Result<(), Error> {
        self.inner.ensure_alive()?;
        self.inner.effector.clear_history();
        Ok(())
    }
}

impl AgentInner {
    fn drive(&self, event: StreamEvent) {
        let outputs = self.machine.lock().apply(&event);
        self.presenter.present_all(outputs, event.request_id.as_deref());
    }

    fn ensure_alive(&self) -> Result<(), StateError> {
        if *self.lifecycle.lock() == AgentLifecycle::Destroyed {
            return Err(StateError::AgentDestroyed(self.agent_id.clone()));
        }
        Ok(())
    }

    fn ensure_running(&self, operation: &'static str) -> Result<(), StateError> {
        match *self.lifecycle.lock() {
            AgentLifecycle::Running => Ok(()),
            AgentLifecycle::Destroyed => Err(StateError::AgentDestroyed(self.agent_id.clone())),
            other => Err(StateError::InvalidLifecycle {
                operation,
                lifecycle: other.to_string(),
            }),
        }
    }

    fn swap_lifecycle(
        &self,
        operation: &'static str,
        from: AgentLifecycle,
        to: AgentLifecycle,
    ) -> Result<(), StateError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            current if current == from => {
                *lifecycle = to;
                Ok(())
            }
            AgentLifecycle::Destroyed => Err(StateError::AgentDestroyed(self.agent_id.clone())),
            other => Err(StateError::InvalidLifecycle {
                operation,
                lifecycle: other.to_string(),
            }),
        }
    }

    fn present_lifecycle(&self, lifecycle: AgentLifecycle, previous: AgentLifecycle) {
        self.presenter.present(
            EventPayload::AgentLifecycle(LifecycleEventData { lifecycle, previous }),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axon_core::error::ProviderError;
    use axon_core::provider::{FragmentReceiver, ProviderRequest};
    use axon_core::session::Session;
    use axon_core::tool::ToolRegistry;
    use std::time::Duration;

    struct UnreachableProvider;

    #[async_trait]
    impl Provider for UnreachableProvider {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<FragmentReceiver, ProviderError> {
            Err(ProviderError::NotConfigured("unreachable".into()))
        }
    }

    fn agent(bus: &SystemBus) -> RuntimeAgent {
        let setup = AgentSetup {
            agent_id: "agent_1".into(),
            image: ImageRecord::new("img_1"),
            container_id: None,
            session: Session::new("session_1").into_shared(),
            settings: LoopSettings {
                model: "test".into(),
                system_prompt: None,
                max_tokens: 256,
                temperature: None,
                max_iterations: 3,
                tool_timeout: Duration::from_secs(5),
                resume_token: None,
            },
        };
        RuntimeAgent::new(
            setup,
            bus,
            Arc::new(UnreachableProvider),
            Arc::new(ToolRegistry::new()),
        )
    }

    #[test]
    fn interrupt_releases_a_turn_with_nothing_in_flight() {
        let bus = SystemBus::new();
        let agent = agent(&bus);
        // Without an Effector listening, the turn never gets a run.
        agent.inner.effector.dispose();

        agent.receive("hello").unwrap();
        assert_eq!(agent.state(), AgentState::Thinking);
        assert!(!agent.is_processing());
        assert!(matches!(
            agent.receive("again"),
            Err(Error::State(StateError::Busy { .. }))
        ));

        agent.interrupt().unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
        agent.receive("again").unwrap();
    }

    #[test]
    fn destroyed_agent_rejects_everything() {
        let bus = SystemBus::new();
        let agent = agent(&bus);
        agent.destroy().unwrap();

        assert!(agent.is_destroyed());
        assert!(matches!(
            agent.receive("late"),
            Err(Error::State(StateError::AgentDestroyed(_)))
        ));
        assert!(agent.interrupt().is_err());
        assert!(agent.destroy().is_err());
    }
}
