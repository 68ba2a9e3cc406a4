//! # axon-runtime
//!
//! Runs conversational agents on top of the axon event bus.
//!
//! ```text
//! Runtime ── Container ── RuntimeAgent ── Interactor ─┐
//!                                        Driver  ◄───┤ SystemBus
//!                                        Presenter ──┤
//!                          Effector + Receptor ◄─────┘  (backend)
//! ```
//!
//! Everything an agent produces is published on the bus as a broadcastable
//! event; hosts subscribe through [`Runtime::events`].

pub mod agent;
pub mod config;
pub mod container;
pub mod environment;
pub mod runtime;
pub mod turn;

pub use agent::{AgentSetup, RuntimeAgent};
pub use config::RuntimeConfig;
pub use container::Container;
pub use environment::{Effector, LoopSettings, Receptor, ReceptorMeta};
pub use runtime::Runtime;
pub use turn::{AssistantTurn, ToolUse, TurnAccumulator};
