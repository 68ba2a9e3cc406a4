//! Error types for the axon domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] ties them together
//! for the direct API surface (Container, RuntimeAgent, Runtime, SystemBus).

use thiserror::Error;

/// The top-level error type for all axon operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Bus errors ---
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    // --- Lifecycle / state errors ---
    #[error("Invalid state: {0}")]
    State(#[from] StateError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Lookups ---
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Malformed stream fragment: {0}")]
    Protocol(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Stable code reported on `error_received` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ApiError { .. } => "api_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthenticationFailed(_) => "auth_error",
            Self::StreamInterrupted(_) => "stream_error",
            Self::Protocol(_) => "protocol_error",
            Self::NotConfigured(_) => "not_configured",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network_error",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The bounded queue stayed full for the whole publish timeout.
    #[error("Event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Event bus is destroyed")]
    Closed,

    #[error("Event bus dispatch loop is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("Cannot {operation} a {lifecycle} agent")]
    InvalidLifecycle {
        operation: &'static str,
        lifecycle: String,
    },

    #[error("Agent {agent_id} is busy ({state})")]
    Busy { agent_id: String, state: String },

    #[error("Agent {0} is destroyed")]
    AgentDestroyed(String),

    #[error("Runtime is shut down")]
    RuntimeShutdown,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}
