//! Interactor: turns caller input into bus events.

use axon_core::bus::BusProducer;
use axon_core::event::{EventContext, EventPayload, EventSource, SystemEvent};
use axon_core::message::Message;

pub struct Interactor {
    producer: BusProducer,
    context: EventContext,
}

impl Interactor {
    pub fn new(producer: BusProducer, context: EventContext) -> Self {
        Self { producer, context }
    }

    /// Publish a user message for the Effector and external subscribers.
    pub fn send(&self, message: Message, request_id: String) {
        self.producer.emit(
            SystemEvent::new(EventSource::Agent, EventPayload::UserMessage(message))
                .with_context(Some(self.context.clone()))
                .with_request_id(Some(request_id))
                .broadcastable(true),
        );
    }

    pub fn interrupt(&self, reason: Option<String>, request_id: Option<String>) {
        self.producer.emit(
            SystemEvent::new(EventSource::Agent, EventPayload::Interrupt { reason })
                .with_context(Some(self.context.clone()))
                .with_request_id(request_id),
        );
    }
}
