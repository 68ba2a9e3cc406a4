//! Bus-driven session persistence.
//!
//! The recorder subscribes to broadcast events and hands them to a background
//! task over a channel. The bus handler only enqueues, so a slow or failing
//! store never delays dispatch or the agentic loop. Writes are best-effort:
//! store errors are logged and the event is dropped.

use axon_core::agent::AgentLifecycle;
use axon_core::bus::{BusConsumer, EventFilter, SubscribeOptions, Unsubscribe};
use axon_core::error::BusError;
use axon_core::event::{EventPayload, SystemEvent};
use axon_core::persistence::SessionStore;
use axon_core::session::{Session, SessionState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Command {
    Record(Box<SystemEvent>),
    Flush(oneshot::Sender<()>),
}

/// Persists sessions, messages, and session state observed on the bus.
pub struct SessionRecorder {
    tx: mpsc::UnboundedSender<Command>,
    subscription: Unsubscribe,
    task: JoinHandle<()>,
}

impl SessionRecorder {
    /// Subscribe to `consumer` and start writing into `store`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn attach(consumer: &BusConsumer, store: Arc<dyn SessionStore>) -> Result<Self, BusError> {
        let handle = Handle::try_current().map_err(|_| BusError::NotRunning)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let sender = tx.clone();
        let subscription = consumer.on_with(
            EventFilter::Any,
            move |event| {
                if is_recorded(event) {
                    let _ = sender.send(Command::Record(Box::new(event.clone())));
                }
            },
            SubscribeOptions::new().with_filter(|event| event.broadcastable),
        );

        let task = handle.spawn(run(store, rx));
        debug!("Session recorder attached");
        Ok(Self {
            tx,
            subscription,
            task,
        })
    }

    /// Wait until every event recorded so far has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Unsubscribe, drain the backlog, and stop the writer task.
    pub async fn close(self) {
        self.subscription.unsubscribe();
        self.flush().await;
        self.task.abort();
        let _ = self.task.await;
        debug!("Session recorder closed");
    }
}

fn is_recorded(event: &SystemEvent) -> bool {
    event.session_id().is_some()
        && matches!(
            event.payload,
            EventPayload::UserMessage(_)
                | EventPayload::AssistantMessage(_)
                | EventPayload::ToolResultMessage(_)
                | EventPayload::StateChange(_)
                | EventPayload::AgentLifecycle(_)
        )
}

async fn run(store: Arc<dyn SessionStore>, mut rx: mpsc::UnboundedReceiver<Command>) {
    // Sessions created in the store and not yet closed
    let mut known: HashSet<String> = HashSet::new();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(event) => {
                if let Err(e) = record(store.as_ref(), &mut known, &event).await {
                    warn!(
                        store = store.name(),
                        event_type = %event.event_type(),
                        "Failed to persist event: {e}"
                    );
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn record(
    store: &dyn SessionStore,
    known: &mut HashSet<String>,
    event: &SystemEvent,
) -> Result<(), axon_core::error::StoreError> {
    let Some(session_id) = event.session_id() else {
        return Ok(());
    };
    if !known.contains(session_id) {
        store.create_session(&Session::new(session_id)).await?;
        known.insert(session_id.to_string());
    }

    match &event.payload {
        EventPayload::UserMessage(message)
        | EventPayload::AssistantMessage(message)
        | EventPayload::ToolResultMessage(message) => store.save_message(message).await,
        EventPayload::StateChange(data) => {
            store
                .update_session_state(session_id, SessionState::from(data.state))
                .await
        }
        EventPayload::AgentLifecycle(data) if data.lifecycle == AgentLifecycle::Destroyed => {
            known.remove(session_id);
            store
                .update_session_state(session_id, SessionState::Closed)
                .await
        }
        _ => Ok(()),
    }
}
