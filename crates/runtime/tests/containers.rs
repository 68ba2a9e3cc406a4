//! Containers, image reuse, and persistence through the runtime's event feed.

mod common;

use axon_core::agent::{AgentLifecycle, ImageRecord};
use axon_core::bus::SubscribeOptions;
use axon_core::event::{EventPayload, EventType};
use axon_core::message::Role;
use axon_core::persistence::SessionStore;
use axon_core::session::SessionState;
use axon_core::tool::ToolRegistry;
use axon_persistence::{InMemoryStore, SessionRecorder};
use axon_runtime::{Runtime, RuntimeConfig};
use common::{Recorder, ScriptedProvider, Step, text_reply, wait_settled};
use std::sync::Arc;
use tokio_stream::StreamExt;

#[tokio::test]
async fn run_image_twice_reuses_one_agent() {
    let provider = ScriptedProvider::new(Vec::<Step>::new());
    let runtime = Runtime::new(RuntimeConfig::default(), provider, ToolRegistry::new()).unwrap();
    let container = runtime.create_container(Some("workspace")).unwrap();
    let image = ImageRecord::new("img_assistant").with_system_prompt("help");

    let (first, reused_first) = container.run_image(&image, None).unwrap();
    let (second, reused_second) = container.run_image(&image, None).unwrap();
    let (third, reused_third) = container.run_image(&image, None).unwrap();

    assert!(!reused_first);
    assert!(reused_second && reused_third);
    assert_eq!(first.agent_id(), second.agent_id());
    assert_eq!(second.agent_id(), third.agent_id());
    assert_eq!(container.agent_count(), 1);
    assert!(container.is_image_online("img_assistant"));

    assert!(container.stop_image("img_assistant"));
    assert_eq!(first.lifecycle(), AgentLifecycle::Destroyed);
    assert_eq!(container.list_sessions().len(), 1);
}

#[tokio::test]
async fn agents_in_different_containers_are_isolated() {
    let provider = ScriptedProvider::new([Step::Reply(text_reply("from a"))]);
    let runtime = Runtime::new(RuntimeConfig::default(), provider, ToolRegistry::new()).unwrap();
    let recorder = Recorder::attach(&runtime.events());

    let a = runtime.create_container(Some("a")).unwrap();
    let b = runtime.create_container(Some("b")).unwrap();
    let image = ImageRecord::new("img_shared");
    let (agent_a, _) = a.run_image(&image, None).unwrap();
    let (agent_b, reused) = b.run_image(&image, None).unwrap();
    assert!(!reused, "image reuse is per container");

    agent_a.receive("hi").unwrap();
    wait_settled(&agent_a, &recorder).await;

    assert_eq!(agent_a.session().read().messages.len(), 2);
    assert!(agent_b.session().read().messages.is_empty());
    assert!(recorder.states(&agent_b).is_empty());
}

#[tokio::test]
async fn event_stream_follows_one_agent() {
    let provider = ScriptedProvider::new([Step::Reply(text_reply("streamed"))]);
    let runtime = Runtime::new(RuntimeConfig::default(), provider, ToolRegistry::new()).unwrap();
    let agent = runtime.quick_start(None, None).unwrap();

    let mut stream = runtime.events().stream(
        EventType::TurnResponse,
        SubscribeOptions::for_agent(agent.agent_id()),
    );
    agent.receive("stream please").unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(event.broadcastable);
    assert!(matches!(event.payload, EventPayload::TurnResponse(_)));
}

#[tokio::test]
async fn recorder_persists_the_conversation() {
    let provider = ScriptedProvider::new([Step::Reply(text_reply("4"))]);
    let runtime = Runtime::new(RuntimeConfig::default(), provider, ToolRegistry::new()).unwrap();
    let recorder = Recorder::attach(&runtime.events());
    let store = Arc::new(InMemoryStore::new());
    let persisted = SessionRecorder::attach(&runtime.events(), store.clone()).unwrap();

    let agent = runtime.quick_start(None, None).unwrap();
    agent.receive("2+2?").unwrap();
    wait_settled(&agent, &recorder).await;
    persisted.flush().await;

    let messages = store.get_messages(agent.session_id(), 100, 0).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].content, "4");

    let session = store.get_session(agent.session_id()).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Idle);

    agent.destroy().unwrap();
    persisted.flush().await;
    let session = store.get_session(agent.session_id()).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Closed);

    persisted.close().await;
    runtime.shutdown().await;
}
