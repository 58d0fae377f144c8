use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    self, point_id::PointIdOptions, value::Kind, Condition, CreateCollectionBuilder, Filter,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

pub type Payload = JsonMap<String, JsonValue>;

/// Payload field holding the chunk text.
pub const TEXT_FIELD: &str = "text";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl From<Distance> for qdrant::Distance {
    fn from(distance: Distance) -> Self {
        match distance {
            Distance::Cosine => qdrant::Distance::Cosine,
            Distance::Dot => qdrant::Distance::Dot,
            Distance::Euclid => qdrant::Distance::Euclid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub vectors_count: u64,
    pub points_count: u64,
}

#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub metadata: Payload,
}

impl ScoredChunk {
    /// Splits a stored payload into its text and the remaining metadata.
    pub fn from_payload(id: String, score: f32, mut payload: Payload) -> Self {
        let text = match payload.remove(TEXT_FIELD) {
            Some(JsonValue::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Self {
            id,
            score,
            text,
            metadata: payload,
        }
    }
}

/// Collection lifecycle plus upsert and similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// An unreachable store is an error, not a missing collection.
    async fn has_collection(&self, name: &str) -> GatewayResult<bool>;

    /// Failures are reported as `false`; the caller decides what absence means.
    async fn collection_exists(&self, name: &str) -> bool {
        match self.has_collection(name).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!("Failed to check collection {}: {}", name, e);
                false
            }
        }
    }

    /// Returns `true` when a collection was created, `false` when it already
    /// existed and was left alone.
    async fn create_collection(
        &self,
        name: &str,
        vector_size: u64,
        distance: Distance,
        force_recreate: bool,
    ) -> GatewayResult<bool>;

    async fn list_collections(&self) -> GatewayResult<Vec<CollectionInfo>>;

    async fn delete_collection(&self, name: &str) -> GatewayResult<bool>;

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> GatewayResult<()>;

    /// Results come back ordered by descending score, at most `top_k` of them.
    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        top_k: u64,
        score_threshold: Option<f32>,
        metadata_filter: Option<&Payload>,
    ) -> GatewayResult<Vec<ScoredChunk>>;

    /// Stores each text with its embedding and metadata, returning the point ids.
    ///
    /// Length mismatches are rejected before the store is contacted. Ids are
    /// generated when not supplied.
    async fn add_documents(
        &self,
        collection: &str,
        texts: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadata: Option<Vec<Payload>>,
        ids: Option<Vec<String>>,
    ) -> GatewayResult<Vec<String>> {
        let points = build_points(texts, embeddings, metadata, ids)?;
        let ids: Vec<String> = points.iter().map(|p| p.id.clone()).collect();
        self.upsert(collection, points).await?;
        tracing::info!("Added {} documents to collection {}", ids.len(), collection);
        Ok(ids)
    }
}

fn build_points(
    texts: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    metadata: Option<Vec<Payload>>,
    ids: Option<Vec<String>>,
) -> GatewayResult<Vec<StoredPoint>> {
    if texts.len() != embeddings.len() {
        return Err(GatewayError::InvalidInput(format!(
            "Number of documents ({}) must match number of embeddings ({})",
            texts.len(),
            embeddings.len()
        )));
    }
    let metadata = match metadata {
        Some(metadata) if metadata.len() != texts.len() => {
            return Err(GatewayError::InvalidInput(format!(
                "Number of metadata entries ({}) must match number of documents ({})",
                metadata.len(),
                texts.len()
            )));
        }
        Some(metadata) => metadata,
        None => vec![Payload::new(); texts.len()],
    };
    let ids = match ids {
        Some(ids) if ids.len() != texts.len() => {
            return Err(GatewayError::InvalidInput(format!(
                "Number of ids ({}) must match number of documents ({})",
                ids.len(),
                texts.len()
            )));
        }
        Some(ids) => ids,
        None => texts.iter().map(|_| Uuid::new_v4().to_string()).collect(),
    };

    Ok(texts
        .into_iter()
        .zip(embeddings)
        .zip(metadata)
        .zip(ids)
        .map(|(((text, vector), mut payload), id)| {
            payload.insert(TEXT_FIELD.to_string(), JsonValue::String(text));
            StoredPoint {
                id,
                vector,
                payload,
            }
        })
        .collect())
}

/// Qdrant over gRPC.
pub struct QdrantStore {
    client: Qdrant,
}

impl QdrantStore {
    pub fn new(url: &str, api_key: Option<&str>, timeout: Duration) -> GatewayResult<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let mut builder = Qdrant::from_url(url).timeout(timeout);
        if let Some(key) = api_key {
            builder = builder.api_key(key.to_string());
        }
        let client = builder.build().map_err(|e| {
            tracing::error!("Qdrant client build failed: {:?}", e);
            GatewayError::unavailable("vector store", e)
        })?;
        Ok(Self { client })
    }

    async fn collection_counts(&self, name: &str) -> GatewayResult<CollectionInfo> {
        let info = self.client.collection_info(name).await?;
        // Each point carries a single unnamed vector.
        let points_count = info
            .result
            .and_then(|result| result.points_count)
            .unwrap_or(0);
        Ok(CollectionInfo {
            name: name.to_string(),
            vectors_count: points_count,
            points_count,
        })
    }
}

fn point_id_to_string(id: Option<qdrant::PointId>) -> String {
    match id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

fn qdrant_value_to_json(val: QdrantValue) -> JsonValue {
    match val.kind {
        Some(Kind::BoolValue(b)) => JsonValue::Bool(b),
        Some(Kind::IntegerValue(i)) => JsonValue::Number(i.into()),
        Some(Kind::DoubleValue(f)) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(Kind::StringValue(s)) => JsonValue::String(s),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.into_iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(object)) => JsonValue::Object(payload_to_json(object.fields)),
        Some(Kind::NullValue(_)) | None => JsonValue::Null,
    }
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> Payload {
    payload
        .into_iter()
        .map(|(key, value)| (key, qdrant_value_to_json(value)))
        .collect()
}

/// Exact-match conditions on keyword, integer and boolean fields.
fn build_filter(metadata_filter: &Payload) -> GatewayResult<Filter> {
    let conditions = metadata_filter
        .iter()
        .map(|(key, value)| match value {
            JsonValue::String(s) => Ok(Condition::matches(key.as_str(), s.clone())),
            JsonValue::Bool(b) => Ok(Condition::matches(key.as_str(), *b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(|i| Condition::matches(key.as_str(), i))
                .ok_or_else(|| {
                    GatewayError::InvalidInput(format!("Filter on '{}' must be an integer", key))
                }),
            _ => Err(GatewayError::InvalidInput(format!(
                "Unsupported filter value for '{}'",
                key
            ))),
        })
        .collect::<GatewayResult<Vec<_>>>()?;
    Ok(Filter::must(conditions))
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn has_collection(&self, name: &str) -> GatewayResult<bool> {
        Ok(self.client.collection_exists(name).await?)
    }

    async fn create_collection(
        &self,
        name: &str,
        vector_size: u64,
        distance: Distance,
        force_recreate: bool,
    ) -> GatewayResult<bool> {
        if self.client.collection_exists(name).await? {
            if !force_recreate {
                tracing::info!("Collection {} already exists", name);
                return Ok(false);
            }
            tracing::info!("Recreating collection {}", name);
            self.client.delete_collection(name).await?;
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(vector_size, distance.into())),
            )
            .await?;
        tracing::info!("Created collection {} (size {}, {:?})", name, vector_size, distance);
        Ok(true)
    }

    async fn list_collections(&self) -> GatewayResult<Vec<CollectionInfo>> {
        let response = self.client.list_collections().await?;
        let mut collections = Vec::with_capacity(response.collections.len());
        for collection in response.collections {
            collections.push(self.collection_counts(&collection.name).await?);
        }
        Ok(collections)
    }

    async fn delete_collection(&self, name: &str) -> GatewayResult<bool> {
        let response = self.client.delete_collection(name).await?;
        tracing::info!("Deleted collection {}", name);
        Ok(response.result)
    }

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> GatewayResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| PointStruct::new(point.id, point.vector, point.payload))
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        top_k: u64,
        score_threshold: Option<f32>,
        metadata_filter: Option<&Payload>,
    ) -> GatewayResult<Vec<ScoredChunk>> {
        let mut builder = SearchPointsBuilder::new(collection, vector, top_k).with_payload(true);
        if let Some(threshold) = score_threshold {
            builder = builder.score_threshold(threshold);
        }
        if let Some(filter) = metadata_filter.filter(|f| !f.is_empty()) {
            builder = builder.filter(build_filter(filter)?);
        }

        let response = self.client.search_points(builder).await?;
        Ok(response
            .result
            .into_iter()
            .map(|point| {
                ScoredChunk::from_payload(
                    point_id_to_string(point.id),
                    point.score,
                    payload_to_json(point.payload),
                )
            })
            .collect())
    }
}
