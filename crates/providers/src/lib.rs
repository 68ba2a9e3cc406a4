//! LLM provider implementations for axon.
//!
//! All providers implement the `axon_core::Provider` streaming trait and
//! yield typed `StreamFragment`s.

pub mod anthropic;

pub use anthropic::AnthropicProvider;
