pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ChatConfig;
use crate::services::{
    BackendRegistry, ChatStore, DedupGuard, GenerationPipeline, ModelManager, UploadStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatConfig>,
    pub store: Arc<dyn ChatStore>,
    pub manager: Arc<ModelManager>,
    pub dedup: Arc<DedupGuard>,
    pub pipeline: Arc<GenerationPipeline>,
    pub uploads: UploadStore,
}

impl AppState {
    /// Wire the services together over `store` and the backends in
    /// `registry`. Nothing is loaded yet.
    pub fn new(config: ChatConfig, store: Arc<dyn ChatStore>, registry: BackendRegistry) -> Self {
        let manager = Arc::new(ModelManager::new(
            registry,
            config.models.default_model_id.clone(),
            &config.generation,
        ));
        let uploads = UploadStore::new(config.uploads.root.clone());
        let dedup = Arc::new(DedupGuard::new(store.clone(), &config.dedup));
        let pipeline = Arc::new(GenerationPipeline::new(
            store.clone(),
            manager.clone(),
            uploads.clone(),
            &config,
        ));

        Self {
            config: Arc::new(config),
            store,
            manager,
            dedup,
            pipeline,
            uploads,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    use crate::handlers::{generate, health, messages, model, sessions, uploads};

    let upload_limit = DefaultBodyLimit::max(state.config.uploads.max_upload_bytes);

    Router::new()
        .route("/", get(health::index))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics_handler))
        // Sessions
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        // Generation
        .route("/generate/stream", post(generate::generate_stream))
        .route("/generate", post(generate::generate))
        .route(
            "/log/assistant_message",
            post(messages::log_assistant_message),
        )
        // Model lifecycle
        .route("/model/switch", post(model::switch_model))
        .route("/model/reload", post(model::reload_model))
        .route("/model/available", get(model::available_models))
        .route("/model/info", get(model::model_info))
        // Media
        .route("/upload", post(uploads::upload_files).layer(upload_limit))
        .route(
            "/uploads/:filename",
            get(uploads::get_upload).delete(uploads::delete_upload),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
}
