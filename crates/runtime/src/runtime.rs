//! The runtime facade: owns the bus, the backend, and every container.

use crate::agent::RuntimeAgent;
use crate::config::RuntimeConfig;
use crate::container::{AgentFactory, Container};
use axon_core::agent::ImageRecord;
use axon_core::bus::{BusConsumer, SystemBus, Unsubscribe};
use axon_core::error::{Error, StateError};
use axon_core::provider::Provider;
use axon_core::tool::ToolRegistry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_CONTAINER: &str = "default";

pub struct Runtime {
    factory: AgentFactory,
    containers: Mutex<BTreeMap<String, Arc<Container>>>,
    event_log: Option<Unsubscribe>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("provider", &self.factory.provider.name())
            .field("tools", &self.factory.tools)
            .field("containers", &self.containers.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Runtime {
    /// Build a runtime and start its bus.
    ///
    /// The queued bus backend needs a Tokio runtime to start.
    pub fn new(
        config: RuntimeConfig,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
    ) -> Result<Self, Error> {
        let bus = SystemBus::with_backend(config.bus.clone());
        bus.start()?;

        let event_log = config.event_log.then(|| {
            bus.on_any(|event| {
                debug!(
                    event_type = %event.event_type(),
                    source = ?event.source,
                    category = ?event.category,
                    agent_id = event.agent_id().unwrap_or("-"),
                    "bus event"
                );
            })
        });

        info!(
            provider = provider.name(),
            model = %config.model,
            tools = tools.len(),
            max_iterations = config.max_iterations,
            "Runtime started"
        );
        Ok(Self {
            factory: AgentFactory {
                bus,
                provider,
                tools,
                config: Arc::new(config),
            },
            containers: Mutex::new(BTreeMap::new()),
            event_log,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.factory.config
    }

    /// Subscribe-only view of the bus, for hosts and observers.
    pub fn events(&self) -> BusConsumer {
        self.factory.bus.as_consumer()
    }

    /// Create a container. Without an ID one is generated.
    pub fn create_container(&self, container_id: Option<&str>) -> Result<Arc<Container>, Error> {
        self.ensure_live()?;
        let container_id = container_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("container_{}", Uuid::new_v4().simple()));

        let mut containers = self.containers.lock();
        if containers.contains_key(&container_id) {
            return Err(Error::AlreadyExists {
                kind: "container",
                id: container_id,
            });
        }
        let container = Arc::new(Container::new(&container_id, self.factory.clone()));
        containers.insert(container_id.clone(), container.clone());
        info!(container_id = %container_id, "Container created");
        Ok(container)
    }

    pub fn get_container(&self, container_id: &str) -> Option<Arc<Container>> {
        self.containers.lock().get(container_id).cloned()
    }

    pub fn list_containers(&self) -> Vec<Arc<Container>> {
        self.containers.lock().values().cloned().collect()
    }

    /// Dispose a container and forget it. Returns whether it existed.
    pub fn destroy_container(&self, container_id: &str) -> bool {
        let container = self.containers.lock().remove(container_id);
        match container {
            Some(container) => {
                container.dispose();
                true
            }
            None => false,
        }
    }

    /// Run a fresh image in the default container.
    pub fn quick_start(
        &self,
        system_prompt: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<RuntimeAgent, Error> {
        self.ensure_live()?;
        let container = {
            let mut containers = self.containers.lock();
            containers
                .entry(DEFAULT_CONTAINER.to_string())
                .or_insert_with(|| {
                    Arc::new(Container::new(DEFAULT_CONTAINER, self.factory.clone()))
                })
                .clone()
        };

        let mut image = ImageRecord::generated();
        if let Some(prompt) = system_prompt {
            image = image.with_system_prompt(prompt);
        }
        let (agent, _) = container.run_image(&image, cwd)?;
        Ok(agent)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Dispose every container, drain the bus, then destroy it. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let containers: Vec<Arc<Container>> = std::mem::take(&mut *self.containers.lock())
            .into_values()
            .collect();
        for container in &containers {
            container.dispose();
        }

        if let Some(subscription) = &self.event_log {
            subscription.unsubscribe();
        }
        let bus = &self.factory.bus;
        bus.stop().await;
        bus.destroy();
        info!(containers = containers.len(), "Runtime shut down");
    }

    fn ensure_live(&self) -> Result<(), StateError> {
        if self.is_shut_down() {
            return Err(StateError::RuntimeShutdown);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axon_core::error::ProviderError;
    use axon_core::provider::{FragmentReceiver, ProviderRequest};

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

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::default(),
            Arc::new(OfflineProvider),
            ToolRegistry::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn containers_are_unique_by_id() {
        let rt = runtime();
        rt.create_container(Some("c1")).unwrap();
        assert!(matches!(
            rt.create_container(Some("c1")),
            Err(Error::AlreadyExists { kind: "container", .. })
        ));
        let generated = rt.create_container(None).unwrap();
        assert!(generated.container_id().starts_with("container_"));
        assert_eq!(rt.list_containers().len(), 2);

        assert!(rt.destroy_container("c1"));
        assert!(!rt.destroy_container("c1"));
        assert!(rt.get_container("c1").is_none());
    }

    #[tokio::test]
    async fn quick_start_uses_the_default_container() {
        let rt = runtime();
        let a = rt.quick_start(Some("be terse"), None).unwrap();
        let b = rt.quick_start(None, None).unwrap();
        assert_ne!(a.agent_id(), b.agent_id());

        let default = rt.get_container(DEFAULT_CONTAINER).unwrap();
        assert_eq!(default.agent_count(), 2);
        assert!(default.get_agent(a.agent_id()).is_some());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_final() {
        let rt = runtime();
        let agent = rt.quick_start(None, None).unwrap();

        rt.shutdown().await;
        rt.shutdown().await;

        assert!(rt.is_shut_down());
        assert!(agent.is_destroyed());
        assert!(rt.list_containers().is_empty());
        assert!(matches!(
            rt.create_container(None),
            Err(Error::State(StateError::RuntimeShutdown))
        ));
        assert!(rt.quick_start(None, None).is_err());
    }

    #[tokio::test]
    async fn queued_bus_starts_with_the_runtime() {
        let config = RuntimeConfig::default().with_bus(axon_core::bus::BusBackend::Queued {
            capacity: 16,
            publish_timeout: std::time::Duration::from_millis(100),
        });
        let rt = Runtime::new(config, Arc::new(OfflineProvider), ToolRegistry::new()).unwrap();
        assert!(rt.factory.bus.is_running());
        rt.shutdown().await;
        assert!(!rt.factory.bus.is_running());
    }
}
