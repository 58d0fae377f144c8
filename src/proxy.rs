use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{GatewayError, GatewayResult};

const SERVICE: &str = "inference backend";

/// Server-sent event frames relayed from a streamed generation.
pub type EventStream = BoxStream<'static, GatewayResult<Bytes>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

impl GenerationOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `None` when no option is set, so the field is left out of the payload.
    pub fn into_option(self) -> Option<Self> {
        (!self.is_empty()).then_some(self)
    }
}

/// Body of `/api/generate`, minus the `stream` flag which the proxy sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<GenerationOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub model: String,
    #[serde(default)]
    pub response: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body of `/api/chat`, minus the `stream` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<GenerationOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub message: ChatMessage,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct EmbeddingPayload<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingReply {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct Streamed<'a, T> {
    #[serde(flatten)]
    request: &'a T,
    stream: bool,
}

/// Generation, chat, embedding and model listing against an inference server.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> GatewayResult<GenerateResponse>;

    async fn generate_stream(&self, request: &GenerateRequest) -> GatewayResult<EventStream>;

    async fn chat(&self, request: &ChatRequest) -> GatewayResult<ChatResponse>;

    async fn chat_stream(&self, request: &ChatRequest) -> GatewayResult<EventStream>;

    async fn embed(&self, model: &str, text: &str) -> GatewayResult<Vec<f32>>;

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>>;

    async fn health_check(&self) -> GatewayResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyTimeouts {
    pub generation: Duration,
    pub embedding: Duration,
    pub health: Duration,
}

impl ProxyTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            generation: settings.generation_timeout(),
            embedding: settings.embedding_timeout(),
            health: settings.health_timeout(),
        }
    }
}

/// HTTP client for an Ollama-compatible server.
pub struct OllamaProxy {
    client: Client,
    base_url: String,
    timeouts: ProxyTimeouts,
}

impl OllamaProxy {
    pub fn new(base_url: impl Into<String>, timeouts: ProxyTimeouts) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeouts,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.ollama_base_url.clone(),
            ProxyTimeouts::from_settings(settings),
        )
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> GatewayResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(SERVICE, e))?;
        ensure_success(response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B, timeout: Duration) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(path, body, timeout)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::from_reqwest(SERVICE, e))
    }

    async fn get_tags(&self) -> GatewayResult<TagsResponse> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeouts.health)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(SERVICE, e))?;
        ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::from_reqwest(SERVICE, e))
    }
}

async fn ensure_success(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::upstream(SERVICE, status.as_u16(), body))
}

#[async_trait]
impl LlmBackend for OllamaProxy {
    async fn generate(&self, request: &GenerateRequest) -> GatewayResult<GenerateResponse> {
        tracing::debug!(model = %request.model, "Forwarding generate request");
        let body = Streamed { request, stream: false };
        self.post_json("/api/generate", &body, self.timeouts.generation).await
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> GatewayResult<EventStream> {
        tracing::debug!(model = %request.model, "Forwarding streamed generate request");
        let body = Streamed { request, stream: true };
        let response = self.send("/api/generate", &body, self.timeouts.generation).await?;
        Ok(ndjson_to_sse(response.bytes_stream()))
    }

    async fn chat(&self, request: &ChatRequest) -> GatewayResult<ChatResponse> {
        tracing::debug!(model = %request.model, messages = request.messages.len(), "Forwarding chat request");
        let body = Streamed { request, stream: false };
        self.post_json("/api/chat", &body, self.timeouts.generation).await
    }

    async fn chat_stream(&self, request: &ChatRequest) -> GatewayResult<EventStream> {
        tracing::debug!(model = %request.model, "Forwarding streamed chat request");
        let body = Streamed { request, stream: true };
        let response = self.send("/api/chat", &body, self.timeouts.generation).await?;
        Ok(ndjson_to_sse(response.bytes_stream()))
    }

    async fn embed(&self, model: &str, text: &str) -> GatewayResult<Vec<f32>> {
        let payload = EmbeddingPayload { model, prompt: text };
        let reply: EmbeddingReply = self
            .post_json("/api/embeddings", &payload, self.timeouts.embedding)
            .await?;
        if reply.embedding.is_empty() {
            return Err(GatewayError::upstream(SERVICE, 200, "empty embedding returned"));
        }
        Ok(reply.embedding)
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        Ok(self.get_tags().await?.models)
    }

    async fn health_check(&self) -> GatewayResult<()> {
        self.get_tags().await.map(|_| ())
    }
}

struct SseState {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Re-frames a newline-delimited JSON body as `data: <line>\n\n` events.
///
/// Dropping the returned stream drops the upstream response, which closes
/// the connection to the inference server.
pub fn ndjson_to_sse<S>(upstream: S) -> EventStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = SseState {
        upstream: upstream.boxed(),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    let framed = frame_lines(&mut state.buffer, false);
                    if !framed.is_empty() {
                        return Some((Ok(Bytes::from(framed)), state));
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Upstream stream interrupted");
                    state.finished = true;
                    return Some((Err(GatewayError::from_reqwest(SERVICE, e)), state));
                }
                None => {
                    state.finished = true;
                    let framed = frame_lines(&mut state.buffer, true);
                    if framed.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(framed)), state));
                }
            }
        }
    })
    .boxed()
}

/// Drains complete lines from `buffer` as SSE frames. With `flush`, a
/// trailing partial line is emitted too.
fn frame_lines(buffer: &mut Vec<u8>, flush: bool) -> Vec<u8> {
    let end = if flush {
        buffer.len()
    } else {
        buffer
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1)
    };

    let mut framed = Vec::new();
    for line in buffer[..end].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        framed.extend_from_slice(b"data: ");
        framed.extend_from_slice(line);
        framed.extend_from_slice(b"\n\n");
    }
    buffer.drain(..end);
    framed
}
