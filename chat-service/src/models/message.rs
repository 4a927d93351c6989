//! Chat message model and content fingerprinting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message role: {0}")]
pub struct UnknownRole(String);

impl TryFrom<String> for Role {
    type Error = UnknownRole;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(UnknownRole(value)),
        }
    }
}

/// Content fingerprint over `(session_id, role, content)`, hex-encoded SHA-256.
pub fn fingerprint(session_id: Uuid, role: Role, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(role.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// A single persisted turn half. Immutable once created.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    #[sqlx(try_from = "String")]
    pub role: Role,
    content: String,
    /// Derived from `(session_id, role, content)`; never set independently.
    #[serde(skip)]
    fingerprint: String,
    /// Upload-relative media paths, in attachment order.
    pub images: Vec<String>,
    pub images_used: i32,
    /// For assistant messages, the user text that prompted the reply.
    pub user_input: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(
        id: Uuid,
        session_id: Uuid,
        role: Role,
        content: String,
        images: Vec<String>,
        images_used: i32,
        user_input: Option<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint(session_id, role, &content),
            id,
            session_id,
            role,
            content,
            images,
            images_used,
            user_input,
            created_at: Utc::now(),
        }
    }

    /// A user submission with the media that actually resolved.
    pub fn user(session_id: Uuid, content: String, images: Vec<String>) -> Self {
        let used = images.len() as i32;
        Self::build(Uuid::new_v4(), session_id, Role::User, content, images, used, None)
    }

    /// A completed assistant reply.
    pub fn assistant(
        id: Uuid,
        session_id: Uuid,
        content: String,
        images_used: i32,
        user_input: Option<String>,
    ) -> Self {
        Self::build(
            id,
            session_id,
            Role::Assistant,
            content,
            Vec::new(),
            images_used,
            user_input,
        )
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn into_content(self) -> String {
        self.content
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True when the stored fingerprint matches the content it claims to cover.
    pub fn fingerprint_is_consistent(&self) -> bool {
        self.fingerprint == fingerprint(self.session_id, self.role, &self.content)
    }
}
