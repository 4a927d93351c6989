//! Model lifecycle handlers.

use std::collections::BTreeMap;

use axum::extract::{rejection::JsonRejection, Json, State};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::json_body;
use crate::services::backends::{BackendDescriptor, BackendInfo};
use crate::services::{LoadOutcome, ManagerError};
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SwitchModelRequest {
    #[serde(default)]
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct AvailableModelsResponse {
    pub models: BTreeMap<String, BackendDescriptor>,
    pub current_model: Option<String>,
    pub default_model: String,
}

fn already_loaded(current: &str) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(
        "Model {} is already loaded; restart the service to switch models",
        current
    ))
}

// ============================================================================
// Handlers
// ============================================================================

/// Load a backend when none is active.
///
/// POST /model/switch
pub async fn switch_model(
    State(state): State<AppState>,
    payload: Result<Json<SwitchModelRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = json_body(payload)?;
    let model_id = req.model_id.trim();
    if model_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("model_id is required")));
    }
    if let Some(current) = state.manager.current_id() {
        return Err(already_loaded(&current));
    }

    match state.manager.load(Some(model_id)).await? {
        LoadOutcome::Loaded(id) => Ok(Json(json!({
            "status": "success",
            "message": format!("Model {} loaded", id),
            "model_info": state.manager.describe(),
        }))),
        // Another request loaded a backend between the check and the lock.
        LoadOutcome::AlreadyLoaded(current) => Err(already_loaded(&current)),
    }
}

/// Unload and load the active backend again.
///
/// POST /model/reload
pub async fn reload_model(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    match state.manager.reload().await {
        Ok(id) => Ok(Json(json!({
            "status": "success",
            "message": "Model reloaded successfully",
            "model_id": id,
        }))),
        Err(ManagerError::NotLoaded) => Err(AppError::BadRequest(anyhow::anyhow!(
            "No model is loaded"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// GET /model/available
pub async fn available_models(State(state): State<AppState>) -> Json<AvailableModelsResponse> {
    Json(AvailableModelsResponse {
        models: state.manager.list_available(),
        current_model: state.manager.current_id(),
        default_model: state.manager.default_id().to_string(),
    })
}

/// GET /model/info
pub async fn model_info(State(state): State<AppState>) -> Json<BackendInfo> {
    Json(state.manager.describe())
}
