//! Streaming generation pipeline: one conversational turn from request to
//! terminal event.
//!
//! The turn is validated, the user message is persisted, prior context is
//! assembled and the model is driven. Fragments are relayed as they arrive.
//! The assistant reply is not persisted here; the caller logs it through the
//! deduplication guard once it has the full text.

use crate::config::{ChatConfig, GenerationConfig};
use crate::models::{Message, Session};
use crate::services::backends::{ContextTurn, GenerationParams, GenerationRequest};
use crate::services::history::{self, ContextPair};
use crate::services::model_manager::{ModelManager, StreamOutcome};
use crate::services::preview;
use crate::services::store::ChatStore;
use crate::services::uploads::UploadStore;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Input for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub text: String,
    pub image_paths: Vec<String>,
    pub max_new_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Events delivered to a streaming caller, in order: one `start`, any number
/// of `token`, then exactly one of `done` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Start { text_input: String, images_used: usize },
    Token { content: String },
    Done,
    Error { message: String },
}

/// Reply of the non-streaming call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateResponse {
    pub status: &'static str,
    pub response: String,
    pub text_input: String,
    pub images_used: usize,
}

/// A validated turn whose user message is already stored.
#[derive(Debug)]
struct PreparedTurn {
    session: Session,
    text_input: String,
    images_used: usize,
    request: GenerationRequest,
}

pub struct GenerationPipeline {
    store: Arc<dyn ChatStore>,
    manager: Arc<ModelManager>,
    uploads: UploadStore,
    history_limit: usize,
    max_images: usize,
    defaults: GenerationParams,
    event_buffer: usize,
}

impl GenerationPipeline {
    pub fn new(
        store: Arc<dyn ChatStore>,
        manager: Arc<ModelManager>,
        uploads: UploadStore,
        config: &ChatConfig,
    ) -> Self {
        Self::with_settings(
            store,
            manager,
            uploads,
            config.history.limit_pairs,
            config.uploads.max_images_per_request,
            &config.generation,
        )
    }

    pub fn with_settings(
        store: Arc<dyn ChatStore>,
        manager: Arc<ModelManager>,
        uploads: UploadStore,
        history_limit: usize,
        max_images: usize,
        generation: &GenerationConfig,
    ) -> Self {
        Self {
            store,
            manager,
            uploads,
            history_limit,
            max_images,
            defaults: GenerationParams {
                max_new_tokens: generation.default_max_new_tokens,
                temperature: generation.default_temperature,
            },
            event_buffer: generation.stream_buffer_size.max(1),
        }
    }

    /// Steps shared by both generation paths, up to and including context
    /// assembly. Nothing is persisted unless every check passes.
    async fn prepare(&self, turn: TurnRequest) -> Result<PreparedTurn, AppError> {
        let session_ref = turn.session_id.trim();
        let text = turn.text.trim().to_string();
        if session_ref.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("session_id is required")));
        }
        if text.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Text input is required")));
        }

        let not_found = || AppError::NotFound(anyhow::anyhow!("Session {} not found", session_ref));
        let session_id = Uuid::parse_str(session_ref).map_err(|_| not_found())?;
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(not_found)?;

        if !self.manager.is_loaded() {
            return Err(AppError::ServiceUnavailable("VLM model not loaded".into()));
        }

        let mut media = self.uploads.resolve_all(&turn.image_paths).await;
        if media.len() > self.max_images {
            warn!(
                session_id = %session.id,
                supplied = media.len(),
                max = self.max_images,
                "Too many images; extras dropped"
            );
            media.truncate(self.max_images);
        }
        let (references, paths): (Vec<String>, Vec<_>) = media.into_iter().unzip();
        let images_used = paths.len();

        let user_message = Message::user(session.id, text.clone(), references);
        self.store.append_message(&user_message).await.map_err(|e| {
            error!(
                session_id = %session.id,
                content = %preview(&text),
                error = %e,
                "Failed to persist user message"
            );
            e
        })?;

        let pairs =
            history::load_context(self.store.as_ref(), session.id, self.history_limit, true)
                .await?;
        let history = self.context_turns(pairs).await;

        let request = GenerationRequest {
            prompt: text.clone(),
            media: paths,
            history,
            params: GenerationParams {
                max_new_tokens: turn.max_new_tokens.unwrap_or(self.defaults.max_new_tokens),
                temperature: turn.temperature.unwrap_or(self.defaults.temperature),
            },
        };

        Ok(PreparedTurn {
            session,
            text_input: text,
            images_used,
            request,
        })
    }

    async fn context_turns(&self, pairs: Vec<ContextPair>) -> Vec<ContextTurn> {
        let mut turns = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let user_media = self
                .uploads
                .resolve_all(&pair.user.images)
                .await
                .into_iter()
                .map(|(_, path)| path)
                .collect();
            turns.push(ContextTurn {
                user: pair.user.into_content(),
                user_media,
                assistant: pair.assistant.into_content(),
            });
        }
        turns
    }

    /// Run a turn and stream its events. Validation, lookup, not-loaded and
    /// persistence failures are returned before any event is produced.
    /// Dropping the receiver cancels generation.
    #[instrument(skip(self, turn), fields(session_id = %turn.session_id))]
    pub async fn stream(&self, turn: TurnRequest) -> Result<mpsc::Receiver<StreamEvent>, AppError> {
        let prepared = self.prepare(turn).await?;
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let manager = self.manager.clone();
        let session_id = prepared.session.id;

        info!(
            session_id = %session_id,
            model_id = %prepared.session.model_id,
            history_pairs = prepared.request.history.len(),
            images_used = prepared.images_used,
            "Starting streamed generation"
        );

        tokio::spawn(async move {
            let start = StreamEvent::Start {
                text_input: prepared.text_input.clone(),
                images_used: prepared.images_used,
            };
            if tx.send(start).await.is_err() {
                return;
            }

            let started = tokio::select! {
                _ = tx.closed() => return,
                started = manager.generate_stream(prepared.request) => started,
            };
            let mut generation = match started {
                Ok(generation) => generation,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Generation could not start");
                    let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    fragment = generation.next_fragment() => match fragment {
                        Some(content) => {
                            if tx.send(StreamEvent::Token { content }).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                }
            }

            let terminal = match generation.finish().await {
                StreamOutcome::Completed { fragments } => {
                    info!(session_id = %session_id, fragments, "Streamed generation finished");
                    StreamEvent::Done
                }
                StreamOutcome::Cancelled { .. } => return,
                StreamOutcome::Failed(e) => {
                    error!(
                        session_id = %session_id,
                        content = %preview(&prepared.text_input),
                        error = %e,
                        "Streamed generation failed"
                    );
                    StreamEvent::Error { message: e.to_string() }
                }
            };
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }

    /// Run a turn to completion and return the whole reply.
    #[instrument(skip(self, turn), fields(session_id = %turn.session_id))]
    pub async fn generate(&self, turn: TurnRequest) -> Result<GenerateResponse, AppError> {
        let prepared = self.prepare(turn).await?;
        let response = self.manager.generate(&prepared.request).await.map_err(|e| {
            error!(
                session_id = %prepared.session.id,
                content = %preview(&prepared.text_input),
                error = %e,
                "Generation failed"
            );
            AppError::from(e)
        })?;

        Ok(GenerateResponse {
            status: "success",
            response,
            text_input: prepared.text_input,
            images_used: prepared.images_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backends::{
        mock::echo_descriptor, BackendDescriptor, BackendRegistry, MockBackend, MockBehavior,
        MockProbe,
    };
    use crate::services::store::InMemoryChatStore;
    use std::time::Duration;

    const SCRIPT_LEN: usize = 50;

    async fn slow_pipeline(probe: &MockProbe) -> (GenerationPipeline, Arc<ModelManager>, Session) {
        let generation = GenerationConfig {
            stream_buffer_size: 1,
            ..GenerationConfig::default()
        };
        let mut registry = BackendRegistry::new();
        registry.register(
            BackendDescriptor {
                id: "slow".into(),
                ..echo_descriptor(2)
            },
            MockBackend::factory(
                MockBehavior::Script((0..SCRIPT_LEN).map(|i| format!("t{i} ")).collect()),
                Duration::from_millis(20),
                probe.clone(),
            ),
        );
        let manager = Arc::new(ModelManager::new(registry, "slow".into(), &generation));
        manager.load(None).await.unwrap();

        let store = Arc::new(InMemoryChatStore::new());
        let session = store
            .create_session(&Session::new("cancel".into(), "slow".into()))
            .await
            .unwrap();
        let pipeline = GenerationPipeline::with_settings(
            store,
            manager.clone(),
            UploadStore::new(std::env::temp_dir()),
            5,
            2,
            &generation,
        );
        (pipeline, manager, session)
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_generation_and_frees_the_model() {
        let probe = MockProbe::new();
        let (pipeline, manager, session) = slow_pipeline(&probe).await;

        let mut events = pipeline
            .stream(TurnRequest {
                session_id: session.id.to_string(),
                text: "count".into(),
                ..TurnRequest::default()
            })
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(StreamEvent::Start { .. })));
        assert!(matches!(events.recv().await, Some(StreamEvent::Token { .. })));
        drop(events);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let emitted = probe.fragments_emitted();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(probe.fragments_emitted(), emitted, "backend kept producing");
        assert!(emitted < SCRIPT_LEN);
        assert_eq!(probe.active(), 0);

        let unloaded = tokio::time::timeout(Duration::from_secs(1), manager.unload())
            .await
            .expect("model lock still held after cancel");
        assert_eq!(unloaded.as_deref(), Some("slow"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let start = serde_json::to_value(StreamEvent::Start {
            text_input: "hi".into(),
            images_used: 2,
        })
        .unwrap();
        assert_eq!(start, serde_json::json!({"type": "start", "text_input": "hi", "images_used": 2}));

        let token = serde_json::to_value(StreamEvent::Token { content: "x".into() }).unwrap();
        assert_eq!(token, serde_json::json!({"type": "token", "content": "x"}));

        assert_eq!(
            serde_json::to_value(StreamEvent::Done).unwrap(),
            serde_json::json!({"type": "done"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::Error { message: "boom".into() }).unwrap(),
            serde_json::json!({"type": "error", "message": "boom"})
        );
    }
}
