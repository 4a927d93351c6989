//! Backend served by an OpenAI-compatible inference server.
//!
//! Loading verifies that the server is reachable and hosts the model; the
//! weights themselves live in the server process. Images are sent inline as
//! base64 data URLs.

use super::{Backend, BackendDescriptor, BackendError, GenerationRequest, TokenStream};
use crate::services::uploads::mime_for;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Connection settings shared by every remote backend.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

pub struct RemoteBackend {
    descriptor: BackendDescriptor,
    settings: RemoteSettings,
    client: Option<Client>,
}

impl RemoteBackend {
    pub fn new(descriptor: BackendDescriptor, settings: RemoteSettings) -> Self {
        Self {
            descriptor,
            settings,
            client: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn client(&self) -> Result<&Client, BackendError> {
        self.client.as_ref().ok_or(BackendError::NotLoaded)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn verify_model(&self, client: &Client) -> Result<(), BackendError> {
        let response = self
            .authorize(client.get(self.url("/v1/models")))
            .send()
            .await
            .map_err(|e| BackendError::LoadFailed(format!("inference server unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackendError::LoadFailed(format!(
                "model listing failed with status {}",
                response.status()
            )));
        }

        let listing: ModelList = response
            .json()
            .await
            .map_err(|e| BackendError::LoadFailed(format!("invalid model listing: {}", e)))?;

        if listing
            .data
            .iter()
            .any(|m| m.id == self.descriptor.model_name)
        {
            Ok(())
        } else {
            Err(BackendError::LoadFailed(format!(
                "model {} is not served by {}",
                self.descriptor.model_name, self.settings.base_url
            )))
        }
    }

    async fn build_body(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<ChatCompletionRequest, BackendError> {
        if request.prompt.trim().is_empty() {
            return Err(BackendError::InvalidRequest("prompt is empty".into()));
        }

        let historical = allot_history_media(
            request,
            self.descriptor.max_images_per_request,
            self.descriptor.supports_images,
        );

        let mut messages = vec![ChatMessage {
            role: "system",
            content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
        }];

        for (turn, media) in request.history.iter().zip(historical) {
            messages.push(ChatMessage {
                role: "user",
                content: user_content(&turn.user, &media).await,
            });
            messages.push(ChatMessage {
                role: "assistant",
                content: MessageContent::Text(turn.assistant.clone()),
            });
        }

        let current: Vec<PathBuf> = if self.descriptor.supports_images {
            request
                .media
                .iter()
                .take(self.descriptor.max_images_per_request)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        messages.push(ChatMessage {
            role: "user",
            content: user_content(&request.prompt, &current).await,
        });

        Ok(ChatCompletionRequest {
            model: self.descriptor.model_name.clone(),
            messages,
            max_tokens: request.params.max_new_tokens,
            temperature: request.params.temperature,
            stream,
        })
    }

    async fn post_completion(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, BackendError> {
        let client = self.client()?;
        let response = self
            .authorize(client.post(self.url("/v1/chat/completions")))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.settings.timeout)
                } else {
                    BackendError::NetworkError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::ApiError(format!(
                "inference server error {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn load(&mut self) -> Result<(), BackendError> {
        let client = Client::builder()
            .timeout(self.settings.timeout)
            .build()
            .map_err(|e| BackendError::LoadFailed(format!("http client: {}", e)))?;

        self.verify_model(&client).await?;

        tracing::info!(
            model = %self.descriptor.model_name,
            base_url = %self.settings.base_url,
            "Remote backend ready"
        );
        self.client = Some(client);
        Ok(())
    }

    async fn unload(&mut self) {
        self.client = None;
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        self.client()?;
        let body = self.build_body(request, false).await?;

        tracing::debug!(
            model = %self.descriptor.model_name,
            prompt_len = request.prompt.len(),
            history_turns = request.history.len(),
            media = request.media.len(),
            "Sending completion request"
        );

        let response = self.post_completion(&body).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| BackendError::ApiError(format!("Failed to parse response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::ApiError("response contained no choices".into()))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenStream, BackendError> {
        self.client()?;
        let body = self.build_body(request, true).await?;

        tracing::debug!(
            model = %self.descriptor.model_name,
            prompt_len = request.prompt.len(),
            history_turns = request.history.len(),
            media = request.media.len(),
            "Starting streaming completion request"
        );

        let response = self.post_completion(&body).await?;
        let timeout = self.settings.timeout;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            loop {
                let chunk = tokio::select! {
                    biased;
                    // Caller cancelled; dropping the body aborts the request.
                    _ = tx.closed() => return,
                    chunk = bytes.next() => match chunk {
                        Some(chunk) => chunk,
                        None => return,
                    },
                };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let err = if e.is_timeout() {
                            BackendError::Timeout(timeout)
                        } else {
                            BackendError::NetworkError(e.to_string())
                        };
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                for item in decoder.push(&chunk) {
                    match item {
                        SseItem::Done => return,
                        SseItem::Data(data) => match parse_delta(&data) {
                            Ok(Some(text)) => {
                                if tx.send(Ok(text)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                let _ = tx.send(Err(err)).await;
                                return;
                            }
                        },
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Split the image budget left over after the current turn across history,
/// newest turns first. Returns one media list per history turn, oldest first.
fn allot_history_media(
    request: &GenerationRequest,
    max_images: usize,
    supports_images: bool,
) -> Vec<Vec<PathBuf>> {
    if !supports_images {
        return vec![Vec::new(); request.history.len()];
    }

    let mut budget = max_images.saturating_sub(request.media.len().min(max_images));
    let mut allotted: Vec<Vec<PathBuf>> = request
        .history
        .iter()
        .rev()
        .map(|turn| {
            let take = turn.user_media.len().min(budget);
            budget -= take;
            turn.user_media.iter().take(take).cloned().collect()
        })
        .collect();
    allotted.reverse();
    allotted
}

async fn user_content(text: &str, media: &[PathBuf]) -> MessageContent {
    if media.is_empty() {
        return MessageContent::Text(text.to_string());
    }

    let mut parts = Vec::with_capacity(media.len() + 1);
    for path in media {
        match tokio::fs::read(path).await {
            Ok(bytes) => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", mime_for(path), STANDARD.encode(bytes)),
                },
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image");
            }
        }
    }
    parts.push(ContentPart::Text {
        text: text.to_string(),
    });
    MessageContent::Parts(parts)
}

/// One decoded server-sent event payload.
#[derive(Debug, PartialEq)]
enum SseItem {
    Data(String),
    Done,
}

/// Incremental decoder for `data:` lines of an SSE body.
///
/// Bytes are buffered until a full line is available, so a multi-byte
/// character split across network chunks is decoded intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(chunk);
        let mut items = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Stream line is not valid UTF-8");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if data == "[DONE]" {
                    items.push(SseItem::Done);
                } else if !data.is_empty() {
                    items.push(SseItem::Data(data.to_string()));
                }
            }
        }

        items
    }
}

fn parse_delta(data: &str) -> Result<Option<String>, BackendError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| BackendError::ApiError(format!("malformed stream chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backends::{ContextTurn, GenerationParams};

    fn descriptor(max_images: usize) -> BackendDescriptor {
        BackendDescriptor {
            id: "qwen2_5_7b".into(),
            display_name: "Qwen".into(),
            model_name: "Qwen/Qwen2.5-VL-7B-Instruct".into(),
            description: String::new(),
            supports_images: true,
            supports_audio: false,
            supports_video: false,
            memory_requirement: "~16 GB".into(),
            max_images_per_request: max_images,
        }
    }

    fn settings() -> RemoteSettings {
        RemoteSettings {
            base_url: "http://127.0.0.1:9/".into(),
            api_key: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn decoder_handles_split_lines_and_done() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(
            decoder.push(b":1}\r\n\r\ndata: [DONE]\n\n"),
            vec![SseItem::Data("{\"a\":1}".into()), SseItem::Done]
        );
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::default();
        let items = decoder.push(b": keep-alive\nevent: message\ndata:{\"x\":2}\n");
        assert_eq!(items, vec![SseItem::Data("{\"x\":2}".into())]);
    }

    #[test]
    fn decoder_keeps_characters_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café 😀\"}}]}\n";
        let bytes = line.as_bytes();
        // Cut between the two bytes of "é" (0xC3 0xA9).
        let cut = line.find('é').unwrap() + 1;
        assert_eq!(bytes[cut - 1], 0xC3);

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let items = decoder.push(&bytes[cut..]);
        assert_eq!(items.len(), 1);
        let SseItem::Data(data) = &items[0] else {
            panic!("expected data, got {:?}", items[0]);
        };
        assert_eq!(parse_delta(data).unwrap(), Some("café 😀".to_string()));
    }

    #[test]
    fn delta_content_is_extracted() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_delta(data).unwrap(), Some("Hel".to_string()));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role_only).unwrap(), None);

        assert!(parse_delta("not json").is_err());
    }

    #[test]
    fn url_joins_without_double_slash() {
        let backend = RemoteBackend::new(descriptor(10), settings());
        assert_eq!(
            backend.url("/v1/models"),
            "http://127.0.0.1:9/v1/models"
        );
    }

    #[test]
    fn history_media_uses_leftover_budget_newest_first() {
        let request = GenerationRequest {
            prompt: "now".into(),
            media: vec![PathBuf::from("cur.png")],
            history: vec![
                ContextTurn {
                    user: "old".into(),
                    user_media: vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
                    assistant: "r1".into(),
                },
                ContextTurn {
                    user: "newer".into(),
                    user_media: vec![PathBuf::from("c.png")],
                    assistant: "r2".into(),
                },
            ],
            params: GenerationParams::default(),
        };

        let allotted = allot_history_media(&request, 3, true);
        assert_eq!(allotted[1], vec![PathBuf::from("c.png")]);
        assert_eq!(allotted[0], vec![PathBuf::from("a.png")]);
    }

    #[tokio::test]
    async fn generate_requires_load() {
        let backend = RemoteBackend::new(descriptor(10), settings());
        let request = GenerationRequest {
            prompt: "hi".into(),
            media: Vec::new(),
            history: Vec::new(),
            params: GenerationParams::default(),
        };
        assert_eq!(
            backend.generate(&request).await,
            Err(BackendError::NotLoaded)
        );
    }

    /// One-connection chat server. Sends `first` and `second` as separate
    /// chunks, then SSE comments until the client hangs up, which it reports
    /// on the returned channel.
    async fn chunked_server(
        first: Vec<u8>,
        second: Vec<u8>,
    ) -> (String, tokio::sync::oneshot::Receiver<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 64 * 1024];
            let _ = socket.read(&mut request).await;

            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();

            let chunk = |payload: &[u8]| {
                let mut out = format!("{:x}\r\n", payload.len()).into_bytes();
                out.extend_from_slice(payload);
                out.extend_from_slice(b"\r\n");
                out
            };
            socket.write_all(&chunk(&first)).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&chunk(&second)).await.unwrap();
            socket.flush().await.unwrap();

            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if socket.write_all(&chunk(b": ping\n\n")).await.is_err()
                    || socket.flush().await.is_err()
                {
                    let _ = closed_tx.send(());
                    return;
                }
            }
        });

        (format!("http://{}", addr), closed_rx)
    }

    #[tokio::test]
    async fn streamed_text_survives_split_characters_and_cancel_closes_request() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café 😀\"}}]}\n\n";
        let cut = line.find('é').unwrap() + 1;
        let (base_url, closed) = chunked_server(
            line.as_bytes()[..cut].to_vec(),
            line.as_bytes()[cut..].to_vec(),
        )
        .await;

        let mut backend = RemoteBackend::new(
            descriptor(10),
            RemoteSettings {
                base_url,
                api_key: None,
                timeout: Duration::from_secs(30),
            },
        );
        backend.client = Some(Client::new());

        let request = GenerationRequest {
            prompt: "hi".into(),
            media: Vec::new(),
            history: Vec::new(),
            params: GenerationParams::default(),
        };
        let mut stream = backend.generate_stream(&request).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok("café 😀".to_string())));

        // The server never finishes; dropping the stream must hang up.
        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("inference request still open after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn load_fails_cleanly_when_server_is_down() {
        let mut backend = RemoteBackend::new(descriptor(10), settings());
        let err = backend.load().await.unwrap_err();
        assert!(matches!(err, BackendError::LoadFailed(_)));
        assert!(backend.client.is_none());
    }
}
