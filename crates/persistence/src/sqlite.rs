//! SQLite store.
//!
//! Two tables:
//! - `sessions`: one header row per session
//! - `messages`: conversation history; `iid` preserves insertion order and is
//!   kept when a message is replaced, so an updated tool call stays in place

use async_trait::async_trait;
use axon_core::error::StoreError;
use axon_core::message::{Message, Role, ToolCall};
use axon_core::persistence::SessionStore;
use axon_core::session::{Session, SessionState};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A SQLite-backed [`SessionStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// `":memory:"` gives an ephemeral database on a single connection.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite session store initialized at {path}");
        Ok(store)
    }

    /// Wrap an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id  TEXT PRIMARY KEY NOT NULL,
                user_id     TEXT,
                title       TEXT,
                state       TEXT NOT NULL,
                config      TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                iid           INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id    TEXT UNIQUE NOT NULL,
                session_id    TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                role          TEXT NOT NULL,
                content       TEXT NOT NULL,
                tool_calls    TEXT,
                input_tokens  INTEGER,
                output_tokens INTEGER,
                timestamp     TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, iid)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("messages index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("sessions index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE failed: {e}")))?;
        Ok(())
    }
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Storage(format!("{name} column: {e}")))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, StoreError> {
    let state: String = column(row, "state")?;
    let config: String = column(row, "config")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(Session {
        session_id: column(row, "session_id")?,
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
        state: SessionState::from_str(&state).map_err(StoreError::Storage)?,
        messages: Vec::new(),
        config: serde_json::from_str(&config).unwrap_or_default(),
        user_id: column(row, "user_id")?,
        title: column(row, "title")?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
    let role: String = column(row, "role")?;
    let tool_calls: Option<String> = column(row, "tool_calls")?;
    let timestamp: String = column(row, "timestamp")?;
    let input_tokens: Option<i64> = column(row, "input_tokens")?;
    let output_tokens: Option<i64> = column(row, "output_tokens")?;

    let tool_calls = tool_calls
        .map(|raw| serde_json::from_str::<Vec<ToolCall>>(&raw))
        .transpose()
        .map_err(|e| StoreError::Storage(format!("tool_calls column: {e}")))?;

    Ok(Message {
        message_id: column(row, "message_id")?,
        session_id: column(row, "session_id")?,
        role: Role::from_str(&role).map_err(StoreError::Storage)?,
        content: column(row, "content")?,
        timestamp: parse_time(&timestamp),
        tool_calls,
        input_tokens: input_tokens.map(|n| n as u32),
        output_tokens: output_tokens.map(|n| n as u32),
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let config = serde_json::to_string(&session.config)
            .map_err(|e| StoreError::Storage(format!("Config serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, title, state, config, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(session.state.as_str())
        .bind(&config)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;

        for message in &session.messages {
            self.save_message(message).await?;
        }
        debug!(session_id = %session.session_id, "Stored session");
        Ok(())
    }

    async fn update_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE sessions SET state = ?1, updated_at = ?2 WHERE session_id = ?3")
                .bind(state.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(format!("UPDATE failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT 1 FROM sessions WHERE session_id = ?1")
            .bind(&message.session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Session lookup: {e}")))?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("session {}", message.session_id)));
        }

        let tool_calls = message
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("Tool call serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO messages (message_id, session_id, role, content, tool_calls, input_tokens, output_tokens, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(message_id) DO UPDATE SET
                content = excluded.content,
                tool_calls = excluded.tool_calls,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&tool_calls)
        .bind(message.input_tokens.map(i64::from))
        .bind(message.output_tokens.map(i64::from))
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;

        self.touch(&message.session_id).await?;
        debug!(message_id = %message.message_id, "Stored message");
        Ok(())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ?1 ORDER BY iid ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(session_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Message query: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = match user_id {
            Some(user) => {
                sqlx::query(
                    "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(user)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM sessions ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2")
                    .bind(limit as i64)
                    .bind(offset as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Storage(format!("Session query: {e}")))?;

        rows.iter().map(row_to_session).collect()
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Session query: {e}")))?;

        row.as_ref().map(row_to_session).transpose()
    }
}
