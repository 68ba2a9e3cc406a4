//! The environment: the only part of the runtime that talks to the backend.
//!
//! - [`Receptor`] turns backend stream fragments into bus events
//! - [`Effector`] reacts to user input by running the agentic loop

pub mod effector;
pub mod receptor;

pub use effector::{Effector, LoopSettings};
pub use receptor::{Receptor, ReceptorMeta};
