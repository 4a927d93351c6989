//! Service endpoints: health, index and metrics.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::services::metrics;
use crate::AppState;

/// Liveness plus backend and store status. Unhealthy only when the store
/// cannot be reached; an unloaded model is reported, not failed.
///
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.store.health_check().await {
        Ok(()) => json!({ "status": "ok" }),
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            json!({ "status": "unhealthy", "error": e.to_string() })
        }
    };
    let healthy = database["status"] == "ok";
    let overall = if healthy { "ok" } else { "unhealthy" };

    let body = json!({
        "status": overall,
        "service": state.config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": state.manager.is_loaded(),
        "model_info": state.manager.describe(),
        "database": database,
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// GET /
pub async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": state.config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "metrics": "GET /metrics",
            "sessions": "GET|POST /sessions, GET|DELETE /sessions/:id",
            "generate_stream": "POST /generate/stream",
            "generate": "POST /generate",
            "log_assistant_message": "POST /log/assistant_message",
            "model_switch": "POST /model/switch",
            "model_reload": "POST /model/reload",
            "model_available": "GET /model/available",
            "model_info": "GET /model/info",
            "upload": "POST /upload",
            "uploads": "GET|DELETE /uploads/:filename",
        }
    }))
}

/// Prometheus text exposition.
///
/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::get_metrics(),
    )
}
