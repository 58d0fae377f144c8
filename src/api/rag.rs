use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use super::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{CollectionDeleteResponse, CollectionsResponse};
use crate::rag::{IngestRequest, IngestResult, RagAnswer, RagQuery, SearchRequest, SearchResponse};

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> GatewayResult<Json<IngestResult>> {
    Ok(Json(state.rag.ingest(request).await?))
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> GatewayResult<Json<SearchResponse>> {
    Ok(Json(state.rag.search(request).await?))
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RagQuery>,
) -> GatewayResult<Json<RagAnswer>> {
    Ok(Json(state.rag.query(request).await?))
}

pub async fn list_collections(
    State(state): State<Arc<AppState>>,
) -> GatewayResult<Json<CollectionsResponse>> {
    let collections = state.rag.store().list_collections().await?;
    Ok(Json(CollectionsResponse { collections }))
}

pub async fn delete_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> GatewayResult<Json<CollectionDeleteResponse>> {
    let store = state.rag.store();
    if !store.has_collection(&name).await? {
        return Err(GatewayError::NotFound(format!("Collection '{}' not found", name)));
    }

    let success = store.delete_collection(&name).await?;
    tracing::info!(collection = %name, success, "Deleted collection");
    Ok(Json(CollectionDeleteResponse {
        collection: name,
        success,
    }))
}
