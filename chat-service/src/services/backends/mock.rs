//! In-process backend with scripted output.
//!
//! Serves as the `echo` development backend and as the test double for the
//! lifecycle manager and streaming pipeline.

use super::{
    Backend, BackendDescriptor, BackendError, BackendFactory, GenerationRequest, TokenStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the mock produces.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Echo the prompt back word by word, prefixed with "Echo:".
    Echo,
    /// Emit exactly these fragments.
    Script(Vec<String>),
    /// Emit these fragments, then fail mid-stream.
    FailAfter {
        fragments: Vec<String>,
        error: String,
    },
    /// Refuse to load.
    FailLoad(String),
}

#[derive(Debug, Default)]
struct ProbeCounters {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    generations: AtomicUsize,
    fragments_emitted: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Shared counters observing how a mock backend was driven.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<ProbeCounters>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.inner.unloads.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.inner.generations.load(Ordering::SeqCst)
    }

    pub fn fragments_emitted(&self) -> usize {
        self.inner.fragments_emitted.load(Ordering::SeqCst)
    }

    /// Generations in progress right now.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping generations ever observed.
    pub fn max_active(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard {
        self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            inner: self.inner.clone(),
        }
    }
}

struct ActiveGuard {
    inner: Arc<ProbeCounters>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Descriptor of the built-in `echo` backend.
pub fn echo_descriptor(max_images_per_request: usize) -> BackendDescriptor {
    BackendDescriptor {
        id: "echo".to_string(),
        display_name: "Echo".to_string(),
        model_name: "echo".to_string(),
        description: "Repeats the prompt back; for development without an inference server"
            .to_string(),
        supports_images: true,
        supports_audio: false,
        supports_video: false,
        memory_requirement: "none".to_string(),
        max_images_per_request,
    }
}

/// Scripted backend.
pub struct MockBackend {
    descriptor: BackendDescriptor,
    behavior: MockBehavior,
    delay: Duration,
    loaded: bool,
    probe: MockProbe,
}

impl MockBackend {
    pub fn new(descriptor: BackendDescriptor, behavior: MockBehavior) -> Self {
        Self {
            descriptor,
            behavior,
            delay: Duration::ZERO,
            loaded: false,
            probe: MockProbe::new(),
        }
    }

    /// Sleep this long before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_probe(mut self, probe: MockProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Registry factory producing mocks that share one probe.
    pub fn factory(behavior: MockBehavior, delay: Duration, probe: MockProbe) -> BackendFactory {
        Arc::new(move |descriptor: &BackendDescriptor| {
            Ok(Box::new(
                MockBackend::new(descriptor.clone(), behavior.clone())
                    .with_delay(delay)
                    .with_probe(probe.clone()),
            ) as Box<dyn Backend>)
        })
    }

    fn fragments_for(&self, request: &GenerationRequest) -> Vec<Result<String, BackendError>> {
        match &self.behavior {
            MockBehavior::Echo => {
                let mut out = vec![Ok("Echo:".to_string())];
                out.extend(
                    request
                        .prompt
                        .split_whitespace()
                        .map(|word| Ok(format!(" {}", word))),
                );
                out
            }
            MockBehavior::Script(fragments) => fragments.iter().cloned().map(Ok).collect(),
            MockBehavior::FailAfter { fragments, error } => {
                let mut out: Vec<_> = fragments.iter().cloned().map(Ok).collect();
                out.push(Err(BackendError::ApiError(error.clone())));
                out
            }
            MockBehavior::FailLoad(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn load(&mut self) -> Result<(), BackendError> {
        if let MockBehavior::FailLoad(reason) = &self.behavior {
            self.loaded = false;
            return Err(BackendError::LoadFailed(reason.clone()));
        }
        self.probe.inner.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        if self.loaded {
            self.probe.inner.unloads.fetch_add(1, Ordering::SeqCst);
        }
        self.loaded = false;
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        if !self.loaded {
            return Err(BackendError::NotLoaded);
        }
        let _active = self.probe.enter();

        let mut text = String::new();
        for fragment in self.fragments_for(request) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            text.push_str(&fragment?);
            self.probe
                .inner
                .fragments_emitted
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(text)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenStream, BackendError> {
        if !self.loaded {
            return Err(BackendError::NotLoaded);
        }

        let guard = self.probe.enter();
        let counters = self.probe.inner.clone();
        let delay = self.delay;
        let items = self.fragments_for(request);

        let stream = futures::stream::iter(items).then(move |item| {
            let _active = &guard;
            let counters = counters.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if item.is_ok() {
                    counters.fragments_emitted.fetch_add(1, Ordering::SeqCst);
                }
                item
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backends::GenerationParams;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            media: Vec::new(),
            history: Vec::new(),
            params: GenerationParams::default(),
        }
    }

    #[tokio::test]
    async fn echo_streams_prompt_words_in_order() {
        let mut backend = MockBackend::new(echo_descriptor(10), MockBehavior::Echo);
        backend.load().await.unwrap();

        let fragments: Vec<String> = backend
            .generate_stream(&request("hello there"))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(fragments, vec!["Echo:", " hello", " there"]);
    }

    #[tokio::test]
    async fn refuses_to_generate_before_load() {
        let backend = MockBackend::new(echo_descriptor(10), MockBehavior::Echo);
        assert_eq!(
            backend.generate(&request("hi")).await,
            Err(BackendError::NotLoaded)
        );
    }

    #[tokio::test]
    async fn fail_load_leaves_backend_unloaded() {
        let mut backend = MockBackend::new(
            echo_descriptor(10),
            MockBehavior::FailLoad("out of memory".into()),
        );
        let err = backend.load().await.unwrap_err();
        assert_eq!(err, BackendError::LoadFailed("out of memory".into()));
        assert!(backend.generate(&request("hi")).await.is_err());
    }

    #[tokio::test]
    async fn probe_tracks_active_stream_until_dropped() {
        let probe = MockProbe::new();
        let mut backend = MockBackend::new(
            echo_descriptor(10),
            MockBehavior::Script(vec!["a".into(), "b".into()]),
        )
        .with_probe(probe.clone());
        backend.load().await.unwrap();

        let stream = backend.generate_stream(&request("x")).await.unwrap();
        assert_eq!(probe.active(), 1);
        drop(stream);
        assert_eq!(probe.active(), 0);
        assert_eq!(probe.max_active(), 1);
    }
}
