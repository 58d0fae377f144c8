use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::cache::{ResponseCache, EMBEDDING_PREFIX};
use crate::error::GatewayResult;
use crate::proxy::LlmBackend;

/// Turns text into a vector with a named embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> GatewayResult<Vec<f32>>;

    /// One call per text, in order, so `result[i]` belongs to `texts[i]`.
    async fn embed_all(&self, model: &str, texts: &[String]) -> GatewayResult<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(model, text).await?);
        }
        Ok(embeddings)
    }
}

#[derive(Serialize)]
struct EmbeddingKey<'a> {
    model: &'a str,
    prompt: &'a str,
}

/// Embedder that consults the response cache before calling the backend.
pub struct CachedEmbedder {
    backend: Arc<dyn LlmBackend>,
    cache: Arc<ResponseCache>,
}

impl CachedEmbedder {
    pub fn new(backend: Arc<dyn LlmBackend>, cache: Arc<ResponseCache>) -> Self {
        Self { backend, cache }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, model: &str, text: &str) -> GatewayResult<Vec<f32>> {
        let key = EmbeddingKey { model, prompt: text };
        if let Some(cached) = self.cache.get::<_, Vec<f32>>(EMBEDDING_PREFIX, &key).await {
            return Ok(cached);
        }

        let embedding = self.backend.embed(model, text).await?;
        self.cache.set(EMBEDDING_PREFIX, &key, &embedding, None).await;
        Ok(embedding)
    }
}
