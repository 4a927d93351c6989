//! Application startup and lifecycle management.

use crate::config::ChatConfig;
use crate::services::{metrics, BackendRegistry, ChatStore, LoadOutcome, PgChatStore};
use crate::{build_router, AppState};
use service_core::error::AppError;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: AppState,
    sweeper: JoinHandle<()>,
}

impl Application {
    /// Build the application against PostgreSQL and the built-in backends.
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let store = PgChatStore::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            e
        })?;

        store.run_migrations().await.map_err(|e| {
            tracing::error!("Failed to run database migrations: {}", e);
            e
        })?;

        let registry =
            BackendRegistry::builtin(&config.models, config.uploads.max_images_per_request);

        Self::build_with(config, Arc::new(store), registry).await
    }

    /// Build the application over an already constructed store and registry.
    pub async fn build_with(
        config: ChatConfig,
        store: Arc<dyn ChatStore>,
        registry: BackendRegistry,
    ) -> Result<Self, AppError> {
        metrics::init_metrics().map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to register metrics: {}", e))
        })?;

        let load_on_startup = config.models.load_on_startup;
        let sweep_interval = config.dedup.sweep_interval();
        let bind_addr = config.common.bind_addr();

        let state = AppState::new(config, store, registry);
        state.uploads.ensure_root().await.map_err(|e| {
            tracing::error!(
                root = %state.uploads.root().display(),
                "Failed to create upload directory: {}",
                e
            );
            e
        })?;

        if load_on_startup {
            match state.manager.load(None).await {
                Ok(LoadOutcome::Loaded(id)) | Ok(LoadOutcome::AlreadyLoaded(id)) => {
                    tracing::info!(model_id = %id, "Startup model ready");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "Startup model load failed; load one through /model/switch"
                    );
                }
            }
        }

        let sweeper = state.dedup.start_sweeper(sweep_interval);

        // Port 0 binds a random port for tests
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", bind_addr, e);
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!(
            service = %state.config.service_name,
            "Chat service listening on port {}",
            http_port
        );

        Ok(Self {
            http_port,
            listener,
            state,
            sweeper,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until a shutdown signal arrives, then release the backend.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let Self {
            listener,
            state,
            sweeper,
            ..
        } = self;
        let manager = state.manager.clone();
        let router = build_router(state);

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweeper.abort();
        if let Some(id) = manager.unload().await {
            tracing::info!(model_id = %id, "Model released on shutdown");
        }
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
