//! Inference backend abstractions and the backend registry.
//!
//! A backend is an opaque generation engine: it can be loaded, asked for a
//! full reply or a stream of text fragments, described, and unloaded. The
//! registry maps backend ids to descriptors and factories so the lifecycle
//! manager can construct whichever one is selected at runtime.

pub mod mock;
pub mod remote;

use crate::config::ModelConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::Stream;

pub use mock::{MockBackend, MockBehavior, MockProbe};
pub use remote::{RemoteBackend, RemoteSettings};

/// Error type for backend operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend not loaded")]
    NotLoaded,

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Failed to load backend: {0}")]
    LoadFailed(String),

    #[error("Inference API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not_loaded",
            Self::UnknownBackend(_) => "unknown_backend",
            Self::LoadFailed(_) => "load_failed",
            Self::ApiError(_) => "api",
            Self::NetworkError(_) => "network",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// One prior exchange used to condition the next reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextTurn {
    pub user: String,
    /// Resolved media attached to the historical user message.
    pub user_media: Vec<PathBuf>,
    pub assistant: String,
}

/// Everything a backend needs for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Resolved, existing media for the current turn.
    pub media: Vec<PathBuf>,
    /// Prior context, oldest first.
    pub history: Vec<ContextTurn>,
    pub params: GenerationParams,
}

/// Ordered text fragments produced by a streaming generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Static description of a registered backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub display_name: String,
    /// Name of the weights as known to the inference engine.
    pub model_name: String,
    pub description: String,
    pub supports_images: bool,
    pub supports_audio: bool,
    pub supports_video: bool,
    /// Approximate accelerator memory needed, e.g. "~16 GB".
    pub memory_requirement: String,
    pub max_images_per_request: usize,
}

/// Live capability report for the active backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendInfo {
    pub model_id: Option<String>,
    pub model_name: String,
    pub display_name: Option<String>,
    pub is_loaded: bool,
    pub supports_images: bool,
    pub supports_audio: bool,
    pub supports_video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_requirement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_images_per_request: Option<usize>,
}

impl BackendInfo {
    /// Sentinel reported while nothing is loaded.
    pub fn not_loaded() -> Self {
        Self {
            model_id: None,
            model_name: "Not loaded".to_string(),
            display_name: None,
            is_loaded: false,
            supports_images: false,
            supports_audio: false,
            supports_video: false,
            memory_requirement: None,
            max_images_per_request: None,
        }
    }

    /// Report for a loaded backend built from its descriptor.
    pub fn loaded(descriptor: &BackendDescriptor) -> Self {
        Self {
            model_id: Some(descriptor.id.clone()),
            model_name: descriptor.model_name.clone(),
            display_name: Some(descriptor.display_name.clone()),
            is_loaded: true,
            supports_images: descriptor.supports_images,
            supports_audio: descriptor.supports_audio,
            supports_video: descriptor.supports_video,
            memory_requirement: Some(descriptor.memory_requirement.clone()),
            max_images_per_request: Some(descriptor.max_images_per_request),
        }
    }
}

/// Capability interface every backend implements.
#[async_trait]
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Acquire whatever heavy resources the backend needs. On failure the
    /// backend must have released everything it acquired.
    async fn load(&mut self) -> Result<(), BackendError>;

    /// Release resources. Must be safe to call when not loaded.
    async fn unload(&mut self);

    /// Generate a complete reply.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError>;

    /// Generate a reply as an ordered stream of fragments.
    async fn generate_stream(&self, request: &GenerationRequest)
        -> Result<TokenStream, BackendError>;

    fn describe(&self) -> BackendInfo {
        BackendInfo::loaded(self.descriptor())
    }
}

/// Constructs a fresh, unloaded backend.
pub type BackendFactory =
    Arc<dyn Fn(&BackendDescriptor) -> Result<Box<dyn Backend>, BackendError> + Send + Sync>;

struct RegistryEntry {
    descriptor: BackendDescriptor,
    factory: BackendFactory,
}

/// Mapping of backend id to descriptor and factory.
#[derive(Default)]
pub struct BackendRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. A later registration with the same id replaces
    /// the earlier one.
    pub fn register(&mut self, descriptor: BackendDescriptor, factory: BackendFactory) {
        self.entries.insert(
            descriptor.id.clone(),
            RegistryEntry {
                descriptor,
                factory,
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn descriptor(&self, id: &str) -> Option<&BackendDescriptor> {
        self.entries.get(id).map(|e| &e.descriptor)
    }

    /// All descriptors keyed by id.
    pub fn descriptors(&self) -> BTreeMap<String, BackendDescriptor> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.descriptor.clone()))
            .collect()
    }

    /// Build an unloaded backend for `id`.
    pub fn create(&self, id: &str) -> Result<Box<dyn Backend>, BackendError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| BackendError::UnknownBackend(id.to_string()))?;
        (entry.factory)(&entry.descriptor)
    }

    /// The model family served through the configured inference server, plus
    /// the in-process `echo` backend.
    pub fn builtin(config: &ModelConfig, max_images_per_request: usize) -> Self {
        let mut registry = Self::new();
        let settings = RemoteSettings {
            base_url: config.inference_base_url.clone(),
            api_key: config.inference_api_key.clone(),
            timeout: Duration::from_secs(config.inference_timeout_secs),
        };

        let remote_models = [
            (
                "gemma3_12b",
                "Gemma 3 12B",
                "google/gemma-3-12b-it",
                "Google Gemma 3 instruction-tuned vision-language model",
                "~24 GB",
            ),
            (
                "qwen2_5_7b",
                "Qwen2.5-VL 7B",
                "Qwen/Qwen2.5-VL-7B-Instruct",
                "Qwen2.5 vision-language instruct model",
                "~16 GB",
            ),
            (
                "llava_next_mistral_7b",
                "LLaVA-NeXT Mistral 7B",
                "llava-hf/llava-v1.6-mistral-7b-hf",
                "LLaVA-NeXT on a Mistral 7B language tower",
                "~15 GB",
            ),
            (
                "wiswheat_qwen_7b",
                "WisWheat Qwen 7B",
                "WisWheat/WisWheat_Qwen-7B",
                "Agriculture-tuned Qwen 7B vision-language model",
                "~16 GB",
            ),
            (
                "qwen_omni_3b",
                "Qwen2.5-Omni 3B",
                "Qwen/Qwen2.5-Omni-3B",
                "Small omni-modal Qwen model",
                "~8 GB",
            ),
        ];

        for (id, display_name, model_name, description, memory) in remote_models {
            let descriptor = BackendDescriptor {
                id: id.to_string(),
                display_name: display_name.to_string(),
                model_name: model_name.to_string(),
                description: description.to_string(),
                supports_images: true,
                supports_audio: false,
                supports_video: false,
                memory_requirement: memory.to_string(),
                max_images_per_request,
            };
            let settings = settings.clone();
            registry.register(
                descriptor,
                Arc::new(move |descriptor: &BackendDescriptor| {
                    Ok(Box::new(RemoteBackend::new(descriptor.clone(), settings.clone()))
                        as Box<dyn Backend>)
                }),
            );
        }

        registry.register(
            mock::echo_descriptor(max_images_per_request),
            Arc::new(|descriptor: &BackendDescriptor| {
                Ok(Box::new(MockBackend::new(descriptor.clone(), MockBehavior::Echo))
                    as Box<dyn Backend>)
            }),
        );

        registry
    }
}
