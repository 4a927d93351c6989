//! Session and message persistence interface.
//!
//! `PgChatStore` (see `database.rs`) is the production implementation;
//! `InMemoryChatStore` backs tests and local runs without Postgres.

use crate::models::{Message, Role, Session, SessionSummary};
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result of a conditional append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(Message),
    /// An equivalent message already exists; carries its id.
    Duplicate(Uuid),
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<Session, AppError>;

    /// All sessions, most recently updated first.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, AppError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, AppError>;

    /// Delete a session and its messages. Returns false if it did not exist.
    async fn delete_session(&self, id: Uuid) -> Result<bool, AppError>;

    /// Messages of a session in creation order.
    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, AppError>;

    /// The `limit` most recent messages of a session, newest first.
    async fn recent_messages(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, AppError>;

    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, AppError>;

    /// Insert a message and advance the session's `updated_at` atomically.
    /// Fails with `NotFound` if the session does not exist.
    async fn append_message(&self, message: &Message) -> Result<Message, AppError>;

    /// Insert an assistant message unless the same id exists, or a message
    /// with the same fingerprint was created in the session within `window`.
    /// Concurrent callers with equal content serialize; at most one inserts.
    async fn append_unless_duplicate(
        &self,
        message: &Message,
        window: Duration,
    ) -> Result<AppendOutcome, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, Session>,
    /// Insertion order is creation order.
    messages: Vec<Message>,
}

impl MemoryState {
    fn insert(&mut self, message: &Message) -> Result<Message, AppError> {
        let now = Utc::now();
        let session = self.sessions.get_mut(&message.session_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Session {} not found", message.session_id))
        })?;
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Message {} already exists",
                message.id
            )));
        }

        let mut stored = message.clone();
        stored.created_at = now;
        session.updated_at = now;
        self.messages.push(stored.clone());
        Ok(stored)
    }
}

/// Process-local store with the same semantics as the Postgres one.
#[derive(Default)]
pub struct InMemoryChatStore {
    state: Mutex<MemoryState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_session(&self, session: &Session) -> Result<Session, AppError> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Session {} already exists",
                session.id
            )));
        }
        state.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, AppError> {
        let state = self.state.lock().await;
        let mut summaries: Vec<SessionSummary> = state
            .sessions
            .values()
            .map(|session| SessionSummary {
                session: session.clone(),
                message_count: state
                    .messages
                    .iter()
                    .filter(|m| m.session_id == session.id)
                    .count() as i64,
            })
            .collect();
        summaries.sort_by(|a, b| b.session.updated_at.cmp(&a.session.updated_at));
        Ok(summaries)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn delete_session(&self, id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        if state.sessions.remove(&id).is_none() {
            return Ok(false);
        }
        state.messages.retain(|m| m.session_id != id);
        Ok(true)
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn recent_messages(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.session_id == session_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, AppError> {
        let state = self.state.lock().await;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn append_message(&self, message: &Message) -> Result<Message, AppError> {
        self.state.lock().await.insert(message)
    }

    async fn append_unless_duplicate(
        &self,
        message: &Message,
        window: Duration,
    ) -> Result<AppendOutcome, AppError> {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(&message.session_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Session {} not found",
                message.session_id
            )));
        }
        if let Some(existing) = state.messages.iter().find(|m| m.id == message.id) {
            return Ok(AppendOutcome::Duplicate(existing.id));
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let recent = state.messages.iter().rev().find(|m| {
            m.session_id == message.session_id
                && m.role == Role::Assistant
                && m.fingerprint() == message.fingerprint()
                && m.created_at >= cutoff
        });
        if let Some(existing) = recent {
            return Ok(AppendOutcome::Duplicate(existing.id));
        }

        state.insert(message).map(AppendOutcome::Inserted)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
