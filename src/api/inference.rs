use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};

use super::{AppState, SERVICE_NAME};
use crate::cache::{CHAT_PREFIX, INFERENCE_PREFIX};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    ChatCompletionRequest, EmbeddingRequest, EmbeddingResponse, HealthResponse, InferenceRequest,
    ModelsResponse, ServiceInfo,
};
use crate::proxy::{ChatResponse, EventStream, GenerateResponse};

fn event_stream_response(events: EventStream) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(events),
    )
        .into_response()
}

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Authenticated gateway for LLM inference, embeddings and RAG".to_string(),
        health: "/health".to_string(),
    })
}

/// Liveness. Always 200; the backend's reachability is reported in the body.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ollama_status = match state.llm.health_check().await {
        Ok(()) => "connected".to_string(),
        Err(GatewayError::Upstream { .. }) => "disconnected".to_string(),
        Err(e) => {
            tracing::warn!("Inference backend health check failed: {}", e);
            format!("error: {}", e)
        }
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        ollama_status,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> GatewayResult<Json<ModelsResponse>> {
    let models = state.llm.list_models().await?;
    Ok(Json(ModelsResponse { models }))
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InferenceRequest>,
) -> GatewayResult<Response> {
    request.validate()?;
    let stream = request.stream;
    let request = request.into_generate(&state.settings.default_inference_model);

    if stream {
        let events = state.llm.generate_stream(&request).await?;
        return Ok(event_stream_response(events));
    }

    if let Some(cached) = state
        .cache
        .get::<_, GenerateResponse>(INFERENCE_PREFIX, &request)
        .await
    {
        tracing::debug!(model = %request.model, "Generation served from cache");
        return Ok(Json(cached).into_response());
    }

    let response = state.llm.generate(&request).await?;
    state.cache.set(INFERENCE_PREFIX, &request, &response, None).await;
    Ok(Json(response).into_response())
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> GatewayResult<Response> {
    request.validate()?;
    let stream = request.stream;
    let request = request.into_chat(&state.settings.default_inference_model);

    if stream {
        let events = state.llm.chat_stream(&request).await?;
        return Ok(event_stream_response(events));
    }

    if let Some(cached) = state.cache.get::<_, ChatResponse>(CHAT_PREFIX, &request).await {
        tracing::debug!(model = %request.model, "Chat served from cache");
        return Ok(Json(cached).into_response());
    }

    let response = state.llm.chat(&request).await?;
    state.cache.set(CHAT_PREFIX, &request, &response, None).await;
    Ok(Json(response).into_response())
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbeddingRequest>,
) -> GatewayResult<Json<EmbeddingResponse>> {
    let model = request
        .model
        .unwrap_or_else(|| state.settings.default_embedding_model.clone());
    let texts = request.input.into_texts();
    if texts.is_empty() {
        return Err(GatewayError::InvalidInput("input must not be empty".to_string()));
    }

    let embeddings = state.embedder.embed_all(&model, &texts).await?;
    Ok(Json(EmbeddingResponse { model, embeddings }))
}
