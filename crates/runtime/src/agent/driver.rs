//! Driver: admits this agent's stream events into its state machine.

use axon_core::bus::{BusConsumer, Unsubscribe};
use axon_core::event::{EventPayload, EventSource, EventType, SystemEvent};
use parking_lot::Mutex;
use tracing::debug;

/// The Driver's view of an accepted bus event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub timestamp: i64,
    pub request_id: Option<String>,
    pub payload: EventPayload,
}

impl From<&SystemEvent> for StreamEvent {
    fn from(event: &SystemEvent) -> Self {
        Self {
            event_type: event.event_type(),
            timestamp: event.timestamp,
            request_id: event.request_id.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// Whether `event` may drive `agent_id`'s state machine.
///
/// Only environment events of a driveable type that name this agent are
/// admitted. Environment events without an agent context are always dropped.
pub fn accepts(agent_id: &str, event: &SystemEvent) -> bool {
    if event.source != EventSource::Environment || !event.event_type().is_driveable() {
        return false;
    }
    match event.agent_id() {
        Some(id) => id == agent_id,
        None => {
            debug!(
                event_type = %event.event_type(),
                "Dropped environment event without agent context"
            );
            false
        }
    }
}

pub struct Driver {
    agent_id: String,
    subscription: Mutex<Option<Unsubscribe>>,
}

impl Driver {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to the bus, forwarding accepted events to `sink`.
    pub fn connect(
        &self,
        consumer: &BusConsumer,
        sink: impl Fn(StreamEvent) + Send + Sync + 'static,
    ) {
        let agent_id = self.agent_id.clone();
        let subscription = consumer.on_any(move |event| {
            if accepts(&agent_id, event) {
                sink(StreamEvent::from(event));
            }
        });
        if let Some(previous) = self.subscription.lock().replace(subscription) {
            previous.unsubscribe();
        }
    }

    pub fn disconnect(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::bus::SystemBus;
    use axon_core::event::EventContext;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn delta(source: EventSource, context: Option<EventContext>) -> SystemEvent {
        SystemEvent::new(
            source,
            EventPayload::TextDelta {
                index: 0,
                text: "hi".into(),
            },
        )
        .with_context(context)
    }

    #[test]
    fn admits_only_own_environment_events() {
        let mine = Some(EventContext::for_agent("agent_1", "s1"));
        let theirs = Some(EventContext::for_agent("agent_2", "s2"));

        assert!(accepts("agent_1", &delta(EventSource::Environment, mine.clone())));
        assert!(!accepts("agent_1", &delta(EventSource::Environment, theirs)));
        assert!(!accepts("agent_1", &delta(EventSource::Environment, None)));
        assert!(!accepts("agent_1", &delta(EventSource::Agent, mine.clone())));

        let json_delta = SystemEvent::new(
            EventSource::Environment,
            EventPayload::InputJsonDelta {
                index: 0,
                partial_json: "{".into(),
            },
        )
        .with_context(mine);
        assert!(!accepts("agent_1", &json_delta));
    }

    #[test]
    fn forwards_and_disconnects() {
        let bus = SystemBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let driver = Driver::new("agent_1");
        driver.connect(&bus.as_consumer(), move |e| sink.lock().push(e.event_type));

        let context = Some(EventContext::for_agent("agent_1", "s1"));
        bus.emit(delta(EventSource::Environment, context.clone()));
        driver.disconnect();
        bus.emit(delta(EventSource::Environment, context));

        assert_eq!(seen.lock().as_slice(), &[EventType::TextDelta]);
        assert_eq!(bus.subscription_count(), 0);
    }
}
