//! Assistant reply logging.

use axum::extract::{rejection::JsonRejection, Json, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use super::{json_body, session_id_from};
use crate::services::{AssistantReply, LogOutcome};
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// A finished reply reported by the client once its stream completed.
#[derive(Debug, Deserialize, Validate)]
pub struct LogAssistantMessageRequest {
    #[serde(default)]
    pub session_id: String,
    pub message_id: Option<String>,
    #[serde(default)]
    pub content: String,
    pub user_input: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub images_used: i32,
    /// Accepted as a string or a number.
    pub timestamp: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct LogAssistantMessageResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub message_id: Option<Uuid>,
    pub duplicate: bool,
}

impl From<LogOutcome> for LogAssistantMessageResponse {
    fn from(outcome: LogOutcome) -> Self {
        match outcome {
            LogOutcome::Created(message) => Self {
                status: "success",
                message: "Assistant message logged",
                message_id: Some(message.id),
                duplicate: false,
            },
            LogOutcome::AlreadyLogged { reason, message_id } => Self {
                status: "success",
                message: reason.describe(),
                message_id,
                duplicate: true,
            },
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Persist an assistant reply at most once.
///
/// POST /log/assistant_message
pub async fn log_assistant_message(
    State(state): State<AppState>,
    payload: Result<Json<LogAssistantMessageRequest>, JsonRejection>,
) -> Result<Json<LogAssistantMessageResponse>, AppError> {
    let req = json_body(payload)?;
    req.validate()?;

    if req.session_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("session_id is required")));
    }
    let session_id = session_id_from(&req.session_id)?;

    let timestamp = req.timestamp.map(|ts| match ts {
        Value::String(s) => s,
        other => other.to_string(),
    });

    let outcome = state
        .dedup
        .log(AssistantReply {
            session_id,
            message_id: req.message_id.filter(|id| !id.trim().is_empty()),
            content: req.content,
            user_input: req.user_input,
            images_used: req.images_used,
            timestamp,
        })
        .await?;

    Ok(Json(outcome.into()))
}
