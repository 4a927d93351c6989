//! Session CRUD handlers.

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use super::{json_body, session_id_from};
use crate::models::{Message, Session, SessionSummary};
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// Request to open a new conversation.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

/// A session with its full message log, oldest first.
#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub session: Session,
    pub message_count: usize,
    pub messages: Vec<Message>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a session bound to a registered backend.
///
/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionSummary>), AppError> {
    let req = json_body(payload)?;
    req.validate()?;

    let name = req.name.trim();
    let model_id = req.model_id.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("Session name is required")));
    }
    if !state.manager.list_available().contains_key(model_id) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Unknown model: {}",
            model_id
        )));
    }

    let session = state
        .store
        .create_session(&Session::new(name.to_string(), model_id.to_string()))
        .await?;

    tracing::info!(
        session_id = %session.id,
        model_id = %session.model_id,
        "Session created"
    );

    Ok((
        StatusCode::CREATED,
        Json(SessionSummary {
            session,
            message_count: 0,
        }),
    ))
}

/// List sessions, most recently active first.
///
/// GET /sessions
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.store.list_sessions().await?;
    Ok(Json(SessionListResponse { sessions }))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetailResponse>, AppError> {
    let session_id = session_id_from(&id)?;
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Session {} not found", id)))?;
    let messages = state.store.list_messages(session_id).await?;

    Ok(Json(SessionDetailResponse {
        session,
        message_count: messages.len(),
        messages,
    }))
}

/// Delete a session and all of its messages.
///
/// DELETE /sessions/:id
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let session_id = session_id_from(&id)?;
    if !state.store.delete_session(session_id).await? {
        return Err(AppError::NotFound(anyhow::anyhow!("Session {} not found", id)));
    }

    tracing::info!(session_id = %session_id, "Session deleted");
    Ok(Json(json!({
        "status": "success",
        "message": "Session deleted"
    })))
}
