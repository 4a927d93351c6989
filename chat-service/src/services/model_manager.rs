//! Model lifecycle manager.
//!
//! Owns at most one loaded backend per process. A single async mutex covers
//! load, unload, reload and both generation paths, so at most one of them
//! runs at a time. Streaming generation moves the lock guard into a worker
//! task that feeds a bounded channel; the lock is released when the worker
//! ends, whether the stream completed, failed, timed out or the consumer
//! went away.
//!
//! A read-only status snapshot is kept beside the lock so that `is_loaded`,
//! `current_id` and `describe` never wait behind a running generation.

use crate::config::GenerationConfig;
use crate::services::backends::{
    Backend, BackendDescriptor, BackendError, BackendInfo, BackendRegistry, GenerationRequest,
};
use crate::services::metrics;
use futures::StreamExt;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManagerError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Failed to load model {model_id}: {reason}")]
    LoadFailed { model_id: String, reason: String },

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotLoaded => AppError::ServiceUnavailable("Model not loaded".into()),
            ManagerError::UnknownModel(_) => AppError::BadRequest(anyhow::anyhow!(err)),
            _ => AppError::BackendError(anyhow::anyhow!(err)),
        }
    }
}

/// What a `load` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(String),
    /// Something was already loaded; nothing changed.
    AlreadyLoaded(String),
}

/// How a streaming generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed { fragments: usize },
    /// The consumer dropped the stream before the backend finished.
    Cancelled { fragments: usize },
    Failed(ManagerError),
}

/// Handle to a running streaming generation.
pub struct GenerationStream {
    pub model_id: String,
    fragments: mpsc::Receiver<String>,
    worker: JoinHandle<StreamOutcome>,
}

impl GenerationStream {
    /// Next fragment in production order, or `None` once the worker is done.
    pub async fn next_fragment(&mut self) -> Option<String> {
        self.fragments.recv().await
    }

    /// Wait for the worker to finish and report how it ended. Any fragments
    /// not yet received are discarded.
    pub async fn finish(self) -> StreamOutcome {
        drop(self.fragments);
        match self.worker.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Generation worker aborted");
                StreamOutcome::Failed(ManagerError::Backend(BackendError::ApiError(
                    "generation worker aborted".into(),
                )))
            }
        }
    }
}

struct ActiveBackend {
    id: String,
    backend: Box<dyn Backend>,
}

#[derive(Debug, Clone)]
struct Status {
    current_id: Option<String>,
    info: BackendInfo,
}

impl Status {
    fn unloaded() -> Self {
        Self {
            current_id: None,
            info: BackendInfo::not_loaded(),
        }
    }
}

pub struct ModelManager {
    registry: BackendRegistry,
    default_id: String,
    active: Arc<Mutex<Option<ActiveBackend>>>,
    status: RwLock<Status>,
    stream_buffer: usize,
    generation_timeout: Duration,
}

impl ModelManager {
    pub fn new(registry: BackendRegistry, default_id: String, generation: &GenerationConfig) -> Self {
        Self {
            registry,
            default_id,
            active: Arc::new(Mutex::new(None)),
            status: RwLock::new(Status::unloaded()),
            stream_buffer: generation.stream_buffer_size.max(1),
            generation_timeout: generation.timeout(),
        }
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// All registered backends keyed by id.
    pub fn list_available(&self) -> BTreeMap<String, BackendDescriptor> {
        self.registry.descriptors()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().current_id.is_some()
    }

    pub fn current_id(&self) -> Option<String> {
        self.snapshot().current_id
    }

    /// Capabilities of the active backend, or the not-loaded sentinel.
    pub fn describe(&self) -> BackendInfo {
        self.snapshot().info
    }

    fn snapshot(&self) -> Status {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, active: Option<&ActiveBackend>) {
        let status = match active {
            Some(a) => Status {
                current_id: Some(a.id.clone()),
                info: a.backend.describe(),
            },
            None => Status::unloaded(),
        };
        metrics::set_model_loaded(status.current_id.is_some());
        *self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    /// Load `model_id` (or the default). A no-op success if anything is
    /// already loaded: switching requires an unload first.
    #[instrument(skip(self))]
    pub async fn load(&self, model_id: Option<&str>) -> Result<LoadOutcome, ManagerError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            info!(current = %current.id, "Model already loaded; load is a no-op");
            return Ok(LoadOutcome::AlreadyLoaded(current.id.clone()));
        }

        let id = model_id.unwrap_or(&self.default_id).to_string();
        let loaded = self.construct_and_load(&id).await?;
        *active = Some(loaded);
        self.publish(active.as_ref());

        Ok(LoadOutcome::Loaded(id))
    }

    async fn construct_and_load(&self, id: &str) -> Result<ActiveBackend, ManagerError> {
        let mut backend = self.registry.create(id).map_err(|e| match e {
            BackendError::UnknownBackend(id) => ManagerError::UnknownModel(id),
            other => ManagerError::LoadFailed {
                model_id: id.to_string(),
                reason: other.to_string(),
            },
        })?;

        info!(model_id = %id, "Loading model");
        let started = Instant::now();
        match backend.load().await {
            Ok(()) => {
                metrics::record_model_load(id, true);
                info!(
                    model_id = %id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok(ActiveBackend {
                    id: id.to_string(),
                    backend,
                })
            }
            Err(e) => {
                backend.unload().await;
                metrics::record_model_load(id, false);
                error!(model_id = %id, error = %e, "Model load failed");
                Err(ManagerError::LoadFailed {
                    model_id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release the active backend. Returns the id that was loaded, if any.
    #[instrument(skip(self))]
    pub async fn unload(&self) -> Option<String> {
        let mut active = self.active.lock().await;
        let previous = active.take();
        self.publish(None);

        match previous {
            Some(mut current) => {
                current.backend.unload().await;
                info!(model_id = %current.id, "Model unloaded");
                Some(current.id)
            }
            None => None,
        }
    }

    /// Unload and load the active backend again under one lock hold.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<String, ManagerError> {
        let mut active = self.active.lock().await;
        let mut current = active.take().ok_or(ManagerError::NotLoaded)?;
        self.publish(None);

        current.backend.unload().await;
        info!(model_id = %current.id, "Model unloaded for reload");

        let reloaded = self.construct_and_load(&current.id).await?;
        let id = reloaded.id.clone();
        *active = Some(reloaded);
        self.publish(active.as_ref());
        Ok(id)
    }

    /// Complete generation under the exclusive lock.
    #[instrument(skip(self, request), fields(prompt_len = request.prompt.len()))]
    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ManagerError> {
        let active = self.active.lock().await;
        let current = active.as_ref().ok_or(ManagerError::NotLoaded)?;

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.generation_timeout,
            current.backend.generate(request),
        )
        .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(ManagerError::Backend(e)),
            Err(_) => Err(ManagerError::Timeout(self.generation_timeout)),
        };

        let outcome = match &result {
            Ok(_) => "completed",
            Err(ManagerError::Timeout(_)) => "timeout",
            Err(_) => "failed",
        };
        metrics::record_generation(
            &current.id,
            "blocking",
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Start a streaming generation. Fails fast with `NotLoaded`; otherwise
    /// waits for the exclusive lock and hands it to a worker task.
    #[instrument(skip(self, request), fields(prompt_len = request.prompt.len()))]
    pub async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationStream, ManagerError> {
        let guard = self.active.clone().lock_owned().await;
        let model_id = guard
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or(ManagerError::NotLoaded)?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let timeout = self.generation_timeout;
        let worker_model = model_id.clone();

        let worker = tokio::spawn(async move {
            let started = Instant::now();

            let run = async {
                let current = match guard.as_ref() {
                    Some(current) => current,
                    None => return StreamOutcome::Failed(ManagerError::NotLoaded),
                };
                let mut stream = match current.backend.generate_stream(&request).await {
                    Ok(stream) => stream,
                    Err(e) => return StreamOutcome::Failed(ManagerError::Backend(e)),
                };

                let mut fragments = 0usize;
                loop {
                    tokio::select! {
                        biased;
                        _ = tx.closed() => return StreamOutcome::Cancelled { fragments },
                        item = stream.next() => match item {
                            None => return StreamOutcome::Completed { fragments },
                            Some(Ok(fragment)) => {
                                if tx.send(fragment).await.is_err() {
                                    return StreamOutcome::Cancelled { fragments };
                                }
                                fragments += 1;
                            }
                            Some(Err(e)) => return StreamOutcome::Failed(ManagerError::Backend(e)),
                        },
                    }
                }
            };

            let outcome = match tokio::time::timeout(timeout, run).await {
                Ok(outcome) => outcome,
                Err(_) => StreamOutcome::Failed(ManagerError::Timeout(timeout)),
            };

            let (label, count) = match &outcome {
                StreamOutcome::Completed { fragments } => ("completed", *fragments),
                StreamOutcome::Cancelled { fragments } => ("cancelled", *fragments),
                StreamOutcome::Failed(ManagerError::Timeout(_)) => ("timeout", 0),
                StreamOutcome::Failed(_) => ("failed", 0),
            };
            metrics::record_generation(
                &worker_model,
                "stream",
                label,
                started.elapsed().as_secs_f64(),
            );
            metrics::record_tokens_streamed(&worker_model, count as u64);
            if let StreamOutcome::Cancelled { fragments } = &outcome {
                warn!(fragments = *fragments, "Stream consumer went away; generation cancelled");
            }

            drop(guard);
            outcome
        });

        Ok(GenerationStream {
            model_id,
            fragments: rx,
            worker,
        })
    }
}
