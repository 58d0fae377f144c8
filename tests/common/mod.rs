#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, Response};
use futures::stream;
use serde_json::Value;

use llm_gateway::api::{router, AppState};
use llm_gateway::cache::{CacheTtl, MemoryBackend, ResponseCache};
use llm_gateway::config::{CacheBackendKind, Settings, VectorBackendKind};
use llm_gateway::error::{GatewayError, GatewayResult};
use llm_gateway::proxy::{
    ChatMessage, ChatRequest, ChatResponse, EventStream, GenerateRequest, GenerateResponse,
    LlmBackend, ModelInfo,
};
use llm_gateway::rag::memory_store::MemoryVectorStore;

pub const API_KEY: &str = "test-key";
pub const DIMENSIONS: usize = 64;

/// How a failing backend call fails.
#[derive(Debug, Clone, Copy)]
pub enum Outage {
    /// Connection refused.
    Unreachable,
    /// The server answered 500.
    Rejected,
}

impl Outage {
    fn error(self) -> GatewayError {
        match self {
            Outage::Unreachable => GatewayError::unavailable("inference backend", "connection refused"),
            Outage::Rejected => GatewayError::upstream("inference backend", 500, "model not loaded"),
        }
    }
}

/// Inference backend with deterministic bag-of-words embeddings and canned
/// generations. Counts every call it receives.
#[derive(Default)]
pub struct FakeLlm {
    pub generate_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
    pub last_generate: Mutex<Option<GenerateRequest>>,
    generate_outage: Mutex<Option<Outage>>,
    embed_outage: Mutex<Option<(usize, Outage)>>,
}

impl FakeLlm {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Every generation from now on fails.
    pub fn fail_generate(&self, outage: Outage) {
        *self.generate_outage.lock().unwrap() = Some(outage);
    }

    /// Embedding calls fail once `succeeded` of them have gone through.
    pub fn fail_embed_after(&self, succeeded: usize, outage: Outage) {
        *self.embed_outage.lock().unwrap() = Some((succeeded, outage));
    }
}

fn bucket(word: &str) -> usize {
    word.bytes()
        .fold(5381usize, |hash, b| hash.wrapping_mul(33).wrapping_add(b as usize))
        % DIMENSIONS
}

/// Normalised word-count vector; texts sharing words point the same way.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMENSIONS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        vector[bucket(&word.to_lowercase())] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    } else {
        vector[0] = 1.0;
    }
    vector
}

fn canned_events(text: &str) -> EventStream {
    let frames = vec![
        Ok(Bytes::from(format!(
            "data: {}\n\n",
            serde_json::json!({"response": text, "done": false})
        ))),
        Ok(Bytes::from("data: {\"response\":\"\",\"done\":true}\n\n")),
    ];
    Box::pin(stream::iter(frames))
}

#[async_trait]
impl LlmBackend for FakeLlm {
    async fn generate(&self, request: &GenerateRequest) -> GatewayResult<GenerateResponse> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_generate.lock().unwrap() = Some(request.clone());
        if let Some(outage) = *self.generate_outage.lock().unwrap() {
            return Err(outage.error());
        }
        Ok(GenerateResponse {
            model: request.model.clone(),
            response: format!("answer #{}", Self::count(&self.generate_calls)),
            done: true,
            context: None,
            total_duration: Some(1_000),
            load_duration: None,
            prompt_eval_count: Some(request.prompt.len() as u64),
            eval_count: Some(2),
            eval_duration: None,
        })
    }

    async fn generate_stream(&self, _request: &GenerateRequest) -> GatewayResult<EventStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        Ok(canned_events("streamed"))
    }

    async fn chat(&self, request: &ChatRequest) -> GatewayResult<ChatResponse> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse {
            model: request.model.clone(),
            message: ChatMessage {
                role: "assistant".to_string(),
                content: "Paris".to_string(),
            },
            done: true,
            total_duration: None,
            prompt_eval_count: None,
            eval_count: None,
        })
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> GatewayResult<EventStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        Ok(canned_events("streamed"))
    }

    async fn embed(&self, _model: &str, text: &str) -> GatewayResult<Vec<f32>> {
        let previous = self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((succeeded, outage)) = *self.embed_outage.lock().unwrap() {
            if previous >= succeeded {
                return Err(outage.error());
            }
        }
        Ok(bag_of_words(text))
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            name: "qwen2.5:7b".to_string(),
            size: Some(4_700_000_000),
            modified_at: None,
            digest: None,
        }])
    }

    async fn health_check(&self) -> GatewayResult<()> {
        Ok(())
    }
}

pub fn test_settings() -> Settings {
    Settings {
        api_keys: format!("{}, second-key", API_KEY),
        cache_backend: CacheBackendKind::Memory,
        vector_backend: VectorBackendKind::Memory,
        cache_enabled: true,
        monitoring_enabled: true,
        ..Settings::default()
    }
}

pub struct TestApp {
    pub app: axum::Router,
    pub state: Arc<AppState>,
    pub llm: Arc<FakeLlm>,
}

pub fn test_app() -> TestApp {
    let llm = Arc::new(FakeLlm::default());
    let cache = Arc::new(ResponseCache::new(
        Arc::new(MemoryBackend::new()),
        CacheTtl::default(),
    ));
    let state = Arc::new(AppState::new(
        test_settings(),
        llm.clone(),
        cache,
        Arc::new(MemoryVectorStore::new()),
    ));
    TestApp {
        app: router(state.clone()),
        state,
        llm,
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
