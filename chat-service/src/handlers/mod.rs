//! HTTP handlers for chat-service.

pub mod generate;
pub mod health;
pub mod messages;
pub mod model;
pub mod sessions;
pub mod uploads;

use axum::extract::rejection::JsonRejection;
use axum::Json;
use service_core::error::AppError;
use uuid::Uuid;

/// Unwrap a JSON body, reporting malformed or missing bodies as 400.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::BadRequest(anyhow::anyhow!(rejection.body_text())))
}

/// A session reference that does not parse cannot name an existing session.
pub(crate) fn session_id_from(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::NotFound(anyhow::anyhow!("Session {} not found", raw)))
}
