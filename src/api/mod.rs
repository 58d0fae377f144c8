//! HTTP surface: shared state, routing and the handlers behind each path.

pub mod analytics;
pub mod inference;
pub mod middleware;
pub mod rag;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, Method},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::ResponseCache;
use crate::config::Settings;
use crate::error::GatewayResult;
use crate::monitoring::RequestMetrics;
use crate::proxy::{LlmBackend, OllamaProxy};
use crate::rag::embeddings::{CachedEmbedder, Embedder};
use crate::rag::vector_store::VectorStore;
use crate::rag::{build_vector_store, RagDefaults, RagPipeline};

pub const SERVICE_NAME: &str = "llm-gateway";

/// Everything a request handler can reach, built once at startup.
pub struct AppState {
    pub settings: Settings,
    pub llm: Arc<dyn LlmBackend>,
    pub embedder: Arc<dyn Embedder>,
    pub cache: Arc<ResponseCache>,
    pub rag: RagPipeline,
    pub metrics: Arc<RequestMetrics>,
    pub prometheus: Option<PrometheusHandle>,
    api_keys: Vec<String>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        llm: Arc<dyn LlmBackend>,
        cache: Arc<ResponseCache>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(CachedEmbedder::new(llm.clone(), cache.clone()));
        let rag = RagPipeline::new(
            embedder.clone(),
            llm.clone(),
            store,
            RagDefaults::from_settings(&settings),
        );
        let api_keys = settings.valid_api_keys();
        if api_keys.is_empty() {
            tracing::warn!("No API keys configured; every protected request will be rejected");
        }

        Self {
            metrics: Arc::new(RequestMetrics::new(settings.metrics_retention_hours)),
            settings,
            llm,
            embedder,
            cache,
            rag,
            prometheus: None,
            api_keys,
        }
    }

    /// Connects the configured inference, cache and vector store backends.
    pub async fn from_settings(settings: Settings) -> GatewayResult<Self> {
        let llm: Arc<dyn LlmBackend> = Arc::new(OllamaProxy::from_settings(&settings));
        let cache = Arc::new(ResponseCache::connect(&settings).await);
        let store = build_vector_store(&settings)?;
        Ok(Self::new(settings, llm, cache, store))
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn is_valid_key(&self, key: &str) -> bool {
        self.api_keys.iter().any(|valid| valid == key)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let protected = Router::new()
        .route("/models", get(inference::list_models))
        .route("/inference/generate", post(inference::generate))
        .route("/inference/chat", post(inference::chat))
        .route("/embeddings", post(inference::embeddings))
        .route("/rag/ingest", post(rag::ingest))
        .route("/rag/search", post(rag::search))
        .route("/rag/query", post(rag::query))
        .route("/rag/collections", get(rag::list_collections))
        .route("/rag/collections/:name", delete(rag::delete_collection))
        .route("/analytics/stats", get(analytics::stats))
        .route("/analytics/errors", get(analytics::recent_errors))
        .route("/analytics/alerts", get(analytics::alerts))
        .route(
            "/analytics/cache",
            get(analytics::cache_stats).delete(analytics::clear_cache),
        )
        .route("/analytics/health", get(analytics::health))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_api_key));

    Router::new()
        .route("/", get(inference::root))
        .route("/health", get(inference::health))
        .route("/metrics", get(prometheus_metrics))
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), middleware::track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
