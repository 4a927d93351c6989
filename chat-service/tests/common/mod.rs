//! Shared helpers for chat-service integration tests.
//!
//! The router is driven in-process over an in-memory store and scripted
//! backends, so no database or inference server is needed.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chat_service::config::{
    ChatConfig, DatabaseConfig, DedupConfig, GenerationConfig, HistoryConfig, ModelConfig,
    UploadConfig,
};
use chat_service::services::backends::mock::echo_descriptor;
use chat_service::services::backends::{
    BackendDescriptor, BackendRegistry, MockBackend, MockBehavior, MockProbe,
};
use chat_service::services::InMemoryChatStore;
use chat_service::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const MAX_IMAGES: usize = 2;

pub fn test_config(upload_root: &std::path::Path) -> ChatConfig {
    ChatConfig {
        common: CoreConfig::default(),
        service_name: "chat-service".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 0,
        },
        uploads: UploadConfig {
            root: upload_root.to_path_buf(),
            max_images_per_request: MAX_IMAGES,
            max_upload_bytes: 64 * 1024,
        },
        models: ModelConfig {
            default_model_id: "echo".to_string(),
            load_on_startup: false,
            inference_base_url: "http://127.0.0.1:9".to_string(),
            inference_api_key: None,
            inference_timeout_secs: 5,
        },
        history: HistoryConfig::default(),
        dedup: DedupConfig::default(),
        generation: GenerationConfig {
            timeout_secs: 5,
            ..GenerationConfig::default()
        },
    }
}

fn descriptor(id: &str) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        display_name: id.to_string(),
        model_name: id.to_string(),
        ..echo_descriptor(MAX_IMAGES)
    }
}

/// Registry with an echo backend, a fixed script (fast and slow), one that
/// fails mid-stream and one that never loads.
pub fn test_registry(probe: &MockProbe) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(
        echo_descriptor(MAX_IMAGES),
        MockBackend::factory(MockBehavior::Echo, Duration::ZERO, probe.clone()),
    );
    registry.register(
        descriptor("scripted"),
        MockBackend::factory(
            MockBehavior::Script(vec!["Hello".into(), ", ".into(), "world".into()]),
            Duration::ZERO,
            probe.clone(),
        ),
    );
    registry.register(
        descriptor("slow"),
        MockBackend::factory(
            MockBehavior::Script(vec!["one".into(), "two".into(), "three".into()]),
            Duration::from_millis(20),
            probe.clone(),
        ),
    );
    registry.register(
        descriptor("flaky"),
        MockBackend::factory(
            MockBehavior::FailAfter {
                fragments: vec!["partial".into()],
                error: "device lost".into(),
            },
            Duration::ZERO,
            probe.clone(),
        ),
    );
    registry.register(
        descriptor("broken"),
        MockBackend::factory(
            MockBehavior::FailLoad("out of memory".into()),
            Duration::ZERO,
            probe.clone(),
        ),
    );
    registry
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryChatStore>,
    pub probe: MockProbe,
    router: Router,
    _uploads: TempDir,
}

impl TestApp {
    /// An app with nothing loaded.
    pub async fn spawn() -> Self {
        let uploads = tempfile::tempdir().expect("Failed to create upload dir");
        let probe = MockProbe::new();
        let store = Arc::new(InMemoryChatStore::new());
        let state = AppState::new(
            test_config(uploads.path()),
            store.clone(),
            test_registry(&probe),
        );

        TestApp {
            router: build_router(state.clone()),
            state,
            store,
            probe,
            _uploads: uploads,
        }
    }

    /// An app with `model_id` loaded.
    pub async fn with_model(model_id: &str) -> Self {
        let app = Self::spawn().await;
        app.state
            .manager
            .load(Some(model_id))
            .await
            .expect("Failed to load test model");
        app
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes()
            .to_vec();
        (status, headers, bytes)
    }

    pub async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let (status, _, bytes) = self.send(request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.json(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.json(Method::POST, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.json(Method::DELETE, uri, None).await
    }

    /// Create a session and return its id.
    pub async fn create_session(&self, name: &str, model_id: &str) -> String {
        let (status, body) = self
            .post(
                "/sessions",
                serde_json::json!({ "name": name, "model_id": model_id }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create session failed: {}", body);
        body["id"].as_str().expect("session id").to_string()
    }

    /// POST to the streaming endpoint and return the status and decoded
    /// event payloads.
    pub async fn stream(&self, body: Value) -> (StatusCode, Vec<Value>) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/generate/stream")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("Failed to build request");
        let (status, _, bytes) = self.send(request).await;
        (status, parse_sse(&String::from_utf8_lossy(&bytes)))
    }
}

/// Decode the `data:` lines of an event stream body.
pub fn parse_sse(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event is not JSON"))
        .collect()
}

/// Build a multipart body with one `files` part per `(name, bytes)`.
pub fn multipart_body(files: &[(&str, &[u8])]) -> (String, Vec<u8>) {
    let boundary = "chat-service-test-boundary";
    let mut body = Vec::new();
    for (name, bytes) in files {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\n",
                name
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    (format!("multipart/form-data; boundary={}", boundary), body)
}
