pub mod embeddings;
pub mod memory_store;
pub mod vector_store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::{Settings, VectorBackendKind};
use crate::error::{GatewayError, GatewayResult};
use crate::indexer::chunker::{chunk_with_metadata, ChunkStrategy};
use crate::proxy::{GenerateRequest, GenerationOptions, LlmBackend};

use self::embeddings::Embedder;
use self::memory_store::MemoryVectorStore;
use self::vector_store::{Distance, Payload, QdrantStore, ScoredChunk, VectorStore};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions based on the provided context. \
Use only the information from the context to answer the question. \
If the context doesn't contain enough information to answer the question, say so.";

/// Text embedded once to learn a model's vector dimension.
const PROBE_TEXT: &str = "test";

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub collection: String,
    pub chunks_created: usize,
    pub chunk_ids: Vec<String>,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub score_threshold: Option<f32>,
    /// Exact-match constraints on chunk metadata.
    #[serde(default)]
    pub filter: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub content: String,
    pub score: f32,
    pub metadata: Payload,
}

impl From<ScoredChunk> for SearchResult {
    fn from(chunk: ScoredChunk) -> Self {
        Self {
            chunk_id: chunk.id,
            content: chunk.text,
            score: chunk.score,
            metadata: chunk.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub collection: String,
    pub total_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RagQuery {
    pub query: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl RagQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            collection: None,
            top_k: None,
            model: None,
            system_prompt: None,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub query: String,
    pub answer: String,
    pub sources: Vec<SearchResult>,
    pub model: String,
    pub collection: String,
}

/// Values used when a request leaves a parameter unset.
#[derive(Debug, Clone)]
pub struct RagDefaults {
    pub collection: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: u64,
    pub embedding_model: String,
    pub inference_model: String,
}

impl RagDefaults {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            collection: settings.default_collection.clone(),
            chunk_size: settings.chunk_size,
            chunk_overlap: settings.chunk_overlap,
            top_k: settings.top_k_results,
            embedding_model: settings.default_embedding_model.clone(),
            inference_model: settings.default_inference_model.clone(),
        }
    }

    fn collection(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.collection)
            .to_string()
    }

    fn top_k(&self, requested: Option<u64>) -> u64 {
        requested.filter(|&k| k > 0).unwrap_or(self.top_k)
    }
}

/// Builds the configured vector store backend.
pub fn build_vector_store(settings: &Settings) -> GatewayResult<Arc<dyn VectorStore>> {
    match settings.vector_backend {
        VectorBackendKind::Qdrant => Ok(Arc::new(QdrantStore::new(
            &settings.qdrant_url,
            settings.qdrant_api_key(),
            settings.vector_timeout(),
        )?)),
        VectorBackendKind::Memory => {
            tracing::info!("Using in-memory vector store");
            Ok(Arc::new(MemoryVectorStore::new()))
        }
    }
}

/// Numbered `[Source N]` blocks in ranked order.
fn build_context(sources: &[SearchResult]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| format!("[Source {}]\n{}", i + 1, source.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Context:\n{}\n\nQuestion: {}\n\nAnswer based on the context above:",
        context, question
    )
}

fn require_text(field: &str, value: &str) -> GatewayResult<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Ingest, search and question answering over a vector store.
pub struct RagPipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn LlmBackend>,
    store: Arc<dyn VectorStore>,
    defaults: RagDefaults,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn LlmBackend>,
        store: Arc<dyn VectorStore>,
        defaults: RagDefaults,
    ) -> Self {
        Self {
            embedder,
            generator,
            store,
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn defaults(&self) -> &RagDefaults {
        &self.defaults
    }

    pub async fn ingest(&self, request: IngestRequest) -> GatewayResult<IngestResult> {
        let collection = self.defaults.collection(request.collection.as_deref());
        let chunk_size = request
            .chunk_size
            .filter(|&size| size > 0)
            .unwrap_or(self.defaults.chunk_size);
        let chunk_overlap = request.chunk_overlap.unwrap_or(self.defaults.chunk_overlap);
        let model = self.defaults.embedding_model.as_str();

        // 1. Chunk before touching any backend
        let chunks = chunk_with_metadata(
            &request.content,
            chunk_size,
            chunk_overlap,
            ChunkStrategy::Recursive,
        );
        if chunks.is_empty() {
            return Err(GatewayError::InvalidInput(
                "No chunks generated from document".to_string(),
            ));
        }

        // 2. Create the collection, sized by a probe embedding
        if !self.store.has_collection(&collection).await? {
            tracing::info!("Creating new collection: {}", collection);
            let probe = self.embedder.embed(model, PROBE_TEXT).await?;
            self.store
                .create_collection(&collection, probe.len() as u64, Distance::Cosine, false)
                .await?;
        }

        // 3. One embedding per chunk, in chunk order
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        tracing::info!("Generating embeddings for {} chunks", texts.len());
        let embeddings = self.embedder.embed_all(model, &texts).await?;

        // 4. Positional metadata wins over caller metadata
        let metadata: Vec<Payload> = chunks
            .iter()
            .map(|chunk| {
                let mut payload = request.metadata.clone();
                payload.insert("chunk_index".into(), JsonValue::from(chunk.index));
                payload.insert("char_start".into(), JsonValue::from(chunk.char_start));
                payload.insert("char_end".into(), JsonValue::from(chunk.char_end));
                payload.insert("chunk_length".into(), JsonValue::from(chunk.length));
                payload
            })
            .collect();
        let ids: Vec<String> = chunks.iter().map(|_| Uuid::new_v4().to_string()).collect();

        // 5. Upsert
        tracing::info!("Storing {} chunks in collection {}", texts.len(), collection);
        let chunk_ids = self
            .store
            .add_documents(&collection, texts, embeddings, Some(metadata), Some(ids))
            .await?;

        Ok(IngestResult {
            collection,
            chunks_created: chunk_ids.len(),
            chunk_ids,
            embedding_model: model.to_string(),
        })
    }

    async fn retrieve(
        &self,
        collection: &str,
        query: &str,
        top_k: u64,
        score_threshold: Option<f32>,
        filter: Option<&Payload>,
    ) -> GatewayResult<Vec<SearchResult>> {
        if !self.store.has_collection(collection).await? {
            return Err(GatewayError::NotFound(format!(
                "Collection '{}' not found",
                collection
            )));
        }

        let vector = self
            .embedder
            .embed(&self.defaults.embedding_model, query)
            .await?;
        let hits = self
            .store
            .search(collection, vector, top_k, score_threshold, filter)
            .await?;
        Ok(hits.into_iter().map(SearchResult::from).collect())
    }

    pub async fn search(&self, request: SearchRequest) -> GatewayResult<SearchResponse> {
        require_text("query", &request.query)?;
        if let Some(threshold) = request.score_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(GatewayError::InvalidInput(
                    "score_threshold must be between 0 and 1".to_string(),
                ));
            }
        }

        let collection = self.defaults.collection(request.collection.as_deref());
        let top_k = self.defaults.top_k(request.top_k);
        tracing::info!("Searching in collection {}", collection);

        let results = self
            .retrieve(
                &collection,
                &request.query,
                top_k,
                request.score_threshold,
                request.filter.as_ref(),
            )
            .await?;

        Ok(SearchResponse {
            query: request.query,
            total_results: results.len(),
            results,
            collection,
        })
    }

    pub async fn query(&self, request: RagQuery) -> GatewayResult<RagAnswer> {
        require_text("query", &request.query)?;
        if !(0.0..=2.0).contains(&request.temperature) {
            return Err(GatewayError::InvalidInput(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
        if request.max_tokens == Some(0) {
            return Err(GatewayError::InvalidInput(
                "max_tokens must be greater than zero".to_string(),
            ));
        }

        let collection = self.defaults.collection(request.collection.as_deref());
        let top_k = self.defaults.top_k(request.top_k);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.defaults.inference_model.clone());

        // 1. Retrieve
        let sources = self
            .retrieve(&collection, &request.query, top_k, None, None)
            .await?;
        if sources.is_empty() {
            return Err(GatewayError::NotFound("No relevant documents found".to_string()));
        }

        // 2. Assemble the prompt in ranked order
        let context = build_context(&sources);
        let system = request
            .system_prompt
            .clone()
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        // 3. Generate, never streamed
        tracing::info!("Generating answer with model {} from {} sources", model, sources.len());
        let generation = GenerateRequest {
            model: model.clone(),
            prompt: build_prompt(&context, &request.query),
            options: Some(GenerationOptions {
                temperature: Some(request.temperature),
                num_predict: request.max_tokens,
                ..Default::default()
            }),
            system: Some(system),
            context: None,
        };
        let response = self.generator.generate(&generation).await?;

        Ok(RagAnswer {
            query: request.query,
            answer: response.response,
            sources,
            model,
            collection,
        })
    }
}
