//! In-memory store, useful for testing and embedding without a database.

use async_trait::async_trait;
use axon_core::error::StoreError;
use axon_core::message::Message;
use axon_core::persistence::SessionStore;
use axon_core::session::{Session, SessionState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    /// Session headers; `messages` is always empty here.
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
}

/// A store that keeps sessions and messages in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(session_id: &str) -> StoreError {
    StoreError::NotFound(format!("session {session_id}"))
}

#[async_trait]
impl SessionStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.session_id) {
            return Ok(());
        }
        let mut header = session.clone();
        header.messages.clear();
        tables
            .messages
            .insert(session.session_id.clone(), session.messages.clone());
        tables.sessions.insert(session.session_id.clone(), header);
        Ok(())
    }

    async fn update_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        session.state = state;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let Tables { sessions, messages } = &mut *tables;
        let session = sessions
            .get_mut(&message.session_id)
            .ok_or_else(|| not_found(&message.session_id))?;
        session.updated_at = Utc::now();

        let history = messages.entry(message.session_id.clone()).or_default();
        match history.iter_mut().find(|m| m.message_id == message.message_id) {
            Some(existing) => *existing = message.clone(),
            None => history.push(message.clone()),
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(session_id)
            .map(|history| history.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| user_id.is_none_or(|u| s.user_id.as_deref() == Some(u)))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.read().await.sessions.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::message::ToolCall;

    #[tokio::test]
    async fn messages_page_in_order() {
        let store = InMemoryStore::new();
        store.create_session(&Session::new("s1")).await.unwrap();
        for i in 0..5 {
            store
                .save_message(&Message::user("s1", format!("m{i}")))
                .await
                .unwrap();
        }

        let page = store.get_messages("s1", 2, 1).await.unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2"]);
        assert!(store.get_messages("missing", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_message_replaces_by_id() {
        let store = InMemoryStore::new();
        store.create_session(&Session::new("s1")).await.unwrap();

        let call = ToolCall::new("call_1", "calculator", serde_json::json!({"expression": "1+1"}));
        let mut msg = Message::assistant("s1", "").with_tool_calls(vec![call]);
        store.save_message(&msg).await.unwrap();

        msg.tool_call_mut("call_1")
            .unwrap()
            .resolve(serde_json::json!({"value": 2}));
        store.save_message(&msg).await.unwrap();

        let stored = store.get_messages("s1", 10, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        let call = &stored[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.result, Some(serde_json::json!({"value": 2})));
        assert!(call.error.is_none());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update_session_state("ghost", SessionState::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.save_message(&Message::user("ghost", "hi")).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_user() {
        let store = InMemoryStore::new();
        let mut alice = Session::new("a");
        alice.user_id = Some("alice".into());
        store.create_session(&alice).await.unwrap();
        store.create_session(&Session::new("b")).await.unwrap();

        assert_eq!(store.list_sessions(None, 10, 0).await.unwrap().len(), 2);
        let only = store.list_sessions(Some("alice"), 10, 0).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].session_id, "a");
    }

    #[tokio::test]
    async fn create_is_idempotent_and_state_updates() {
        let store = InMemoryStore::new();
        store.create_session(&Session::new("s1")).await.unwrap();
        store
            .update_session_state("s1", SessionState::Processing)
            .await
            .unwrap();
        store.create_session(&Session::new("s1")).await.unwrap();

        let header = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(header.state, SessionState::Processing);
        assert!(header.messages.is_empty());
    }
}
