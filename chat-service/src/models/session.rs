//! Chat session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A conversation bound to one backend for its whole lifetime.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,

    /// Display name chosen by the user.
    pub name: String,

    /// Backend the session was created for. Never changes after creation.
    pub model_id: String,

    pub created_at: DateTime<Utc>,

    /// Advances whenever a message is appended.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session.
    pub fn new(name: String, model_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            model_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Session listing entry with its message count.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub session: Session,
    pub message_count: i64,
}
