//! # Axon Core
//!
//! Domain types, traits, and the event bus for the axon agent runtime.
//! This crate has no transport or backend dependencies: it defines the model
//! every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM backend, tools, storage) is a trait here.
//! Implementations live in their respective crates, so they can be swapped by
//! configuration and replaced with scripted fakes in tests.

pub mod agent;
pub mod bus;
pub mod error;
pub mod event;
pub mod message;
pub mod persistence;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentLifecycle, AgentState, ImageRecord};
pub use bus::{
    BusBackend, BusConsumer, BusProducer, EventFilter, EventStream, SubscribeOptions, SystemBus,
    Unsubscribe,
};
pub use error::{BusError, Error, ProviderError, Result, StateError, StoreError, ToolError};
pub use event::{
    EventCategory, EventContext, EventIntent, EventPayload, EventSource, EventType,
    StateEventData, SystemEvent, TurnEventData,
};
pub use message::{Message, Role, ToolCall};
pub use persistence::SessionStore;
pub use provider::{
    BlockDelta, BlockStart, ContentPart, Provider, ProviderMessage, ProviderRequest, StopReason,
    StreamFragment, ToolDefinition, Usage,
};
pub use session::{Session, SessionState, SharedSession};
pub use tool::{Tool, ToolExecutor, ToolRegistry};
