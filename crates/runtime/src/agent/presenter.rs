//! Presenter: publishes an agent's output to external subscribers.
//!
//! Every payload is wrapped in a fully-contextualized, broadcastable event.
//! Message-category payloads are also written into the session here; this is
//! the only place output reaches conversation history.

use axon_core::bus::BusProducer;
use axon_core::event::{EventCategory, EventContext, EventPayload, EventSource, SystemEvent};
use axon_core::session::{SessionState, SharedSession};

pub struct Presenter {
    producer: BusProducer,
    context: EventContext,
    session: SharedSession,
}

impl Presenter {
    pub fn new(producer: BusProducer, context: EventContext, session: SharedSession) -> Self {
        Self {
            producer,
            context,
            session,
        }
    }

    pub fn present(&self, payload: EventPayload, request_id: Option<&str>) {
        let event = SystemEvent::new(EventSource::Agent, payload)
            .with_context(Some(self.context.clone()))
            .with_request_id(request_id.map(str::to_string))
            .broadcastable(true);

        match (&event.category, &event.payload) {
            (EventCategory::Message, payload) => {
                if let Some(message) = payload.as_message() {
                    self.session.write().upsert(message.clone());
                }
            }
            (_, EventPayload::StateChange(data)) => {
                self.session.write().set_state(SessionState::from(data.state));
            }
            _ => {}
        }

        self.producer.emit(event);
    }

    pub fn present_all(&self, payloads: Vec<EventPayload>, request_id: Option<&str>) {
        for payload in payloads {
            self.present(payload, request_id);
        }
    }

    pub fn close_session(&self) {
        self.session.write().set_state(SessionState::Closed);
    }
}
