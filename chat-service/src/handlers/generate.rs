//! Generation handlers.

use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use validator::Validate;

use super::json_body;
use crate::services::{GenerateResponse, StreamEvent, TurnRequest};
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request DTOs
// ============================================================================

/// Body shared by the streaming and non-streaming calls.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[validate(range(min = 1, max = 8192))]
    pub max_new_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
}

impl From<GenerateRequest> for TurnRequest {
    fn from(req: GenerateRequest) -> Self {
        Self {
            session_id: req.session_id,
            text: req.text,
            image_paths: req.image_paths,
            max_new_tokens: req.max_new_tokens,
            temperature: req.temperature,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Run one turn and stream `start`, `token`... and a terminal `done` or
/// `error` event. Failures before generation starts are plain HTTP errors.
///
/// POST /generate/stream
pub async fn generate_stream(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let req = json_body(payload)?;
    req.validate()?;

    let events = state.pipeline.stream(req.into()).await?;
    let stream = ReceiverStream::new(events).map(|event| Ok(to_sse(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to encode stream event");
        Event::default().data(r#"{"type":"error","message":"Failed to encode event"}"#)
    })
}

/// Run one turn to completion.
///
/// POST /generate
pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, AppError> {
    let req = json_body(payload)?;
    req.validate()?;

    let response = state.pipeline.generate(req.into()).await?;
    Ok(Json(response))
}
