//! Container: one isolation boundary holding agents and their sessions.
//!
//! A container maps each image to at most one live agent. The check and the
//! creation in [`Container::run_image`] happen under one lock, so concurrent
//! callers for the same image always share an agent.

use crate::agent::{AgentSetup, RuntimeAgent};
use crate::config::RuntimeConfig;
use crate::environment::LoopSettings;
use axon_core::agent::ImageRecord;
use axon_core::bus::SystemBus;
use axon_core::error::{Error, StateError};
use axon_core::provider::Provider;
use axon_core::session::{Session, SharedSession};
use axon_core::tool::{ToolExecutor, ToolRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What a container needs to build agents.
#[derive(Clone)]
pub(crate) struct AgentFactory {
    pub bus: SystemBus,
    pub provider: Arc<dyn Provider>,
    pub tools: ToolRegistry,
    pub config: Arc<RuntimeConfig>,
}

impl AgentFactory {
    fn settings(&self, image: &ImageRecord) -> LoopSettings {
        LoopSettings {
            model: image.model.clone().unwrap_or_else(|| self.config.model.clone()),
            system_prompt: image
                .system_prompt
                .clone()
                .or_else(|| self.config.system_prompt.clone()),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            max_iterations: self.config.max_iterations,
            tool_timeout: self.config.tool_timeout,
            resume_token: image.resume_token.clone(),
        }
    }

    fn executor(&self, image: &ImageRecord) -> Arc<dyn ToolExecutor> {
        match image.allowed_tools.as_ref().or(self.config.allowed_tools.as_ref()) {
            Some(allowed) => Arc::new(self.tools.subset(allowed)),
            None => Arc::new(self.tools.clone()),
        }
    }
}

#[derive(Default)]
struct Tables {
    agents: HashMap<String, RuntimeAgent>,
    /// image_id -> agent_id
    images: HashMap<String, String>,
    /// Kept after their agents are gone, until `remove_session`
    sessions: HashMap<String, SharedSession>,
    disposed: bool,
}

pub struct Container {
    container_id: String,
    factory: AgentFactory,
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("Container")
            .field("container_id", &self.container_id)
            .field("agents", &tables.agents.len())
            .field("sessions", &tables.sessions.len())
            .field("disposed", &tables.disposed)
            .finish()
    }
}

impl Container {
    pub(crate) fn new(container_id: impl Into<String>, factory: AgentFactory) -> Self {
        Self {
            container_id: container_id.into(),
            factory,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Return the image's live agent, or create one.
    ///
    /// The flag is `true` when an existing agent was reused.
    pub fn run_image(
        &self,
        image: &ImageRecord,
        cwd: Option<&Path>,
    ) -> Result<(RuntimeAgent, bool), Error> {
        let agent = {
            let mut tables = self.tables.lock();
            if tables.disposed {
                return Err(StateError::RuntimeShutdown.into());
            }

            if let Some(agent_id) = tables.images.get(&image.image_id).cloned() {
                match tables.agents.get(&agent_id) {
                    Some(agent) if !agent.is_destroyed() => {
                        debug!(
                            image_id = %image.image_id,
                            agent_id = %agent_id,
                            "Reusing live agent"
                        );
                        return Ok((agent.clone(), true));
                    }
                    _ => {
                        tables.images.remove(&image.image_id);
                        tables.agents.remove(&agent_id);
                    }
                }
            }

            let agent_id = format!("agent_{}", Uuid::new_v4().simple());
            let session = new_session(image, cwd).into_shared();
            let session_id = session.read().session_id.clone();

            let agent = RuntimeAgent::new(
                AgentSetup {
                    agent_id: agent_id.clone(),
                    image: image.clone(),
                    container_id: Some(self.container_id.clone()),
                    session: session.clone(),
                    settings: self.factory.settings(image),
                },
                &self.factory.bus,
                self.factory.provider.clone(),
                self.factory.executor(image),
            );

            tables.sessions.insert(session_id, session);
            tables.images.insert(image.image_id.clone(), agent_id.clone());
            tables.agents.insert(agent_id, agent.clone());
            agent
        };

        agent.announce();
        info!(
            container_id = %self.container_id,
            image_id = %image.image_id,
            agent_id = %agent.agent_id(),
            "Image is running"
        );
        Ok((agent, false))
    }

    /// Destroy the image's agent, if any. The image itself is untouched.
    pub fn stop_image(&self, image_id: &str) -> bool {
        let agent = {
            let mut tables = self.tables.lock();
            tables
                .images
                .remove(image_id)
                .and_then(|agent_id| tables.agents.remove(&agent_id))
        };
        match agent {
            Some(agent) => {
                teardown(&agent);
                true
            }
            None => false,
        }
    }

    pub fn destroy_agent(&self, agent_id: &str) -> bool {
        let agent = {
            let mut tables = self.tables.lock();
            let agent = tables.agents.remove(agent_id);
            if let Some(agent) = &agent {
                tables.images.remove(agent.image_id());
            }
            agent
        };
        match agent {
            Some(agent) => {
                teardown(&agent);
                true
            }
            None => false,
        }
    }

    /// Destroy every agent. Returns how many were destroyed.
    pub fn destroy_all_agents(&self) -> usize {
        let agents: Vec<RuntimeAgent> = {
            let mut tables = self.tables.lock();
            tables.images.clear();
            tables.agents.drain().map(|(_, agent)| agent).collect()
        };
        for agent in &agents {
            teardown(agent);
        }
        agents.len()
    }

    /// Sessions outlive their agents; a stopped image's session stays readable.
    pub fn get_session(&self, session_id: &str) -> Option<SharedSession> {
        self.tables.lock().sessions.get(session_id).cloned()
    }

    /// Every session, oldest first.
    pub fn list_sessions(&self) -> Vec<SharedSession> {
        let mut sessions: Vec<SharedSession> =
            self.tables.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.read().created_at);
        sessions
    }

    /// Drop a session no live agent is using. Returns whether it was removed.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut tables = self.tables.lock();
        let in_use = tables
            .agents
            .values()
            .any(|agent| agent.session_id() == session_id && !agent.is_destroyed());
        if in_use {
            debug!(session_id, "Session still belongs to a live agent");
            return false;
        }
        tables.sessions.remove(session_id).is_some()
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<RuntimeAgent> {
        self.tables.lock().agents.get(agent_id).cloned()
    }

    pub fn list_agents(&self) -> Vec<RuntimeAgent> {
        self.tables.lock().agents.values().cloned().collect()
    }

    pub fn agent_count(&self) -> usize {
        self.tables.lock().agents.len()
    }

    pub fn agent_id_for_image(&self, image_id: &str) -> Option<String> {
        self.tables.lock().images.get(image_id).cloned()
    }

    /// Whether the image has a live agent.
    pub fn is_image_online(&self, image_id: &str) -> bool {
        let tables = self.tables.lock();
        tables
            .images
            .get(image_id)
            .and_then(|agent_id| tables.agents.get(agent_id))
            .is_some_and(|agent| !agent.is_destroyed())
    }

    /// Destroy every agent and refuse new ones. Idempotent.
    pub fn dispose(&self) {
        {
            let mut tables = self.tables.lock();
            if tables.disposed {
                return;
            }
            tables.disposed = true;
        }
        let destroyed = self.destroy_all_agents();
        info!(container_id = %self.container_id, destroyed, "Container disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.tables.lock().disposed
    }
}

fn new_session(image: &ImageRecord, cwd: Option<&Path>) -> Session {
    let mut session = Session::new(format!("session_{}", Uuid::new_v4().simple()));
    session
        .config
        .insert("image_id".into(), image.image_id.clone().into());
    if let Some(cwd) = cwd {
        session
            .config
            .insert("cwd".into(), cwd.display().to_string().into());
    }
    if let Some(token) = &image.resume_token {
        session
            .config
            .insert("resume_token".into(), token.clone().into());
    }
    if !image.name.is_empty() {
        session.title = Some(image.name.clone());
    }
    session
}

/// Agents can be destroyed directly by their holders; that is not a failure here.
fn teardown(agent: &RuntimeAgent) {
    if let Err(e) = agent.destroy() {
        debug!(agent_id = %agent.agent_id(), "Skipped teardown: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axon_core::agent::AgentLifecycle;
    use axon_core::error::ProviderError;
    use axon_core::event::{EventPayload, EventType};
    use axon_core::provider::{FragmentReceiver, ProviderRequest};
    use axon_core::session::SessionState;
    use std::time::Duration;

    struct OfflineProvider;

    #[async_trait]
    impl Provider for OfflineProvider {
        fn name(&self) -> &str {
            "offline"
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<FragmentReceiver, ProviderError> {
            Err(ProviderError::NotConfigured("offline".into()))
        }
    }

    fn container(bus: &SystemBus) -> Container {
        Container::new(
            "c1",
            AgentFactory {
                bus: bus.clone(),
                provider: Arc::new(OfflineProvider),
                tools: axon_tools::default_registry(),
                config: Arc::new(RuntimeConfig::default().with_system_prompt("be brief")),
            },
        )
    }

    #[test]
    fn run_image_reuses_the_live_agent() {
        let bus = SystemBus::new();
        let c = container(&bus);
        let image = ImageRecord::new("img_1");

        let (first, reused) = c.run_image(&image, None).unwrap();
        assert!(!reused);
        let (second, reused) = c.run_image(&image, None).unwrap();
        assert!(reused);
        let (_, reused) = c.run_image(&image, None).unwrap();
        assert!(reused);

        assert_eq!(first.agent_id(), second.agent_id());
        assert_eq!(c.agent_count(), 1);
        assert_eq!(c.list_sessions().len(), 1);
        assert_eq!(c.agent_id_for_image("img_1").as_deref(), Some(first.agent_id()));
    }

    #[test]
    fn concurrent_run_image_creates_one_agent() {
        let bus = SystemBus::new();
        let c = Arc::new(container(&bus));
        let image = ImageRecord::new("img_1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                let image = image.clone();
                std::thread::spawn(move || c.run_image(&image, None).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, reused)| !reused).count(), 1);
        assert_eq!(c.agent_count(), 1);
    }

    #[test]
    fn session_records_image_and_cwd() {
        let bus = SystemBus::new();
        let c = container(&bus);
        let image = ImageRecord::new("img_1")
            .with_name("Helper")
            .with_resume_token("tok");

        let (agent, _) = c.run_image(&image, Some(Path::new("/tmp/work"))).unwrap();
        let session = c.get_session(agent.session_id()).unwrap();
        let session = session.read();
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.config["image_id"], "img_1");
        assert_eq!(session.config["cwd"], "/tmp/work");
        assert_eq!(session.config["resume_token"], "tok");
        assert_eq!(session.title.as_deref(), Some("Helper"));
    }

    #[test]
    fn sessions_are_removed_only_once_released() {
        let bus = SystemBus::new();
        let c = container(&bus);
        let (agent, _) = c.run_image(&ImageRecord::new("img_1"), None).unwrap();
        let session_id = agent.session_id().to_string();

        assert!(!c.remove_session(&session_id));
        assert!(c.get_session(&session_id).is_some());

        assert!(c.stop_image("img_1"));
        assert!(c.remove_session(&session_id));
        assert!(c.get_session(&session_id).is_none());
        assert!(c.list_sessions().is_empty());
        assert!(!c.remove_session(&session_id));
    }

    #[test]
    fn stop_image_destroys_agent_and_keeps_session() {
        let bus = SystemBus::new();
        let c = container(&bus);
        let (agent, _) = c.run_image(&ImageRecord::new("img_1"), None).unwrap();

        assert!(c.stop_image("img_1"));
        assert!(!c.stop_image("img_1"));
        assert_eq!(agent.lifecycle(), AgentLifecycle::Destroyed);
        assert!(!c.is_image_online("img_1"));

        let session = c.get_session(agent.session_id()).unwrap();
        assert_eq!(session.read().state, SessionState::Closed);

        let (fresh, reused) = c.run_image(&ImageRecord::new("img_1"), None).unwrap();
        assert!(!reused);
        assert_ne!(fresh.agent_id(), agent.agent_id());
    }

    #[test]
    fn directly_destroyed_agent_is_replaced() {
        let bus = SystemBus::new();
        let c = container(&bus);
        let image = ImageRecord::new("img_1");
        let (agent, _) = c.run_image(&image, None).unwrap();
        agent.destroy().unwrap();

        assert!(!c.is_image_online("img_1"));
        let (fresh, reused) = c.run_image(&image, None).unwrap();
        assert!(!reused);
        assert_eq!(c.agent_count(), 1);
        assert!(c.destroy_agent(fresh.agent_id()));
        assert!(!c.destroy_agent(fresh.agent_id()));
        assert!(c.agent_id_for_image("img_1").is_none());
    }

    #[test]
    fn dispose_refuses_new_agents() {
        let bus = SystemBus::new();
        let c = container(&bus);
        c.run_image(&ImageRecord::new("a"), None).unwrap();
        c.run_image(&ImageRecord::new("b"), None).unwrap();

        c.dispose();
        c.dispose();
        assert!(c.is_disposed());
        assert_eq!(c.agent_count(), 0);
        assert!(matches!(
            c.run_image(&ImageRecord::new("c"), None),
            Err(Error::State(StateError::RuntimeShutdown))
        ));
    }

    #[test]
    fn new_agent_announces_running() {
        let bus = SystemBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(EventType::AgentLifecycle, move |e| sink.lock().push(e.clone()));

        let c = container(&bus);
        c.run_image(&ImageRecord::new("img_1"), None).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].broadcastable);
        assert_eq!(seen[0].context.as_ref().and_then(|c| c.container_id.as_deref()), Some("c1"));
        match &seen[0].payload {
            EventPayload::AgentLifecycle(data) => {
                assert_eq!(data.lifecycle, AgentLifecycle::Running);
                assert_eq!(data.previous, AgentLifecycle::Initializing);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn image_settings_override_runtime_defaults() {
        let bus = SystemBus::new();
        let c = container(&bus);
        let image = ImageRecord::new("img_1")
            .with_model("other-model")
            .with_allowed_tools(["missing"])
            .with_resume_token("backend_session_7");

        let settings = c.factory.settings(&image);
        assert_eq!(settings.model, "other-model");
        assert_eq!(settings.resume_token.as_deref(), Some("backend_session_7"));
        assert_eq!(settings.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(settings.tool_timeout, Duration::from_secs(120));
        assert!(c.factory.executor(&image).definitions().is_empty());
        assert_eq!(
            c.factory.executor(&ImageRecord::new("x")).definitions().len(),
            1
        );
    }
}
