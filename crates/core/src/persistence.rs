//! SessionStore trait: durable storage for sessions and their messages.
//!
//! Persistence observes the runtime; it never participates in the agentic
//! loop's control flow. Stores return session headers (`messages` left empty)
//! from `get_session`/`list_sessions`; history is paged with `get_messages`.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::Message;
use crate::session::{Session, SessionState};

/// The core SessionStore trait.
///
/// Implementations: in-memory (for testing and embedding), SQLite.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Insert a session header. Re-creating an existing session is a no-op.
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn update_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<(), StoreError>;

    /// Insert a message, or replace the stored copy with the same `message_id`.
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages of a session in chronological order.
    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Session headers, most recently updated first.
    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
}
