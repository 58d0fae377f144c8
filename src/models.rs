use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::{ChatMessage, ChatRequest, GenerateRequest, GenerationOptions, ModelInfo};
use crate::rag::vector_store::CollectionInfo;

fn default_temperature() -> Option<f32> {
    Some(0.7)
}

fn check_temperature(temperature: Option<f32>) -> GatewayResult<()> {
    match temperature {
        Some(t) if !(0.0..=2.0).contains(&t) => Err(GatewayError::InvalidInput(
            "temperature must be between 0.0 and 2.0".to_string(),
        )),
        _ => Ok(()),
    }
}

fn check_max_tokens(max_tokens: Option<u32>) -> GatewayResult<()> {
    if max_tokens == Some(0) {
        return Err(GatewayError::InvalidInput(
            "max_tokens must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Body of `POST /inference/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub context: Option<Vec<i64>>,
}

impl InferenceRequest {
    pub fn validate(&self) -> GatewayResult<()> {
        check_temperature(self.temperature)?;
        check_max_tokens(self.max_tokens)?;
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(GatewayError::InvalidInput(
                    "top_p must be between 0.0 and 1.0".to_string(),
                ));
            }
        }
        if self.top_k == Some(0) {
            return Err(GatewayError::InvalidInput(
                "top_k must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Backend request with sampling parameters folded into `options`.
    pub fn into_generate(self, default_model: &str) -> GenerateRequest {
        let options = GenerationOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            num_predict: self.max_tokens,
        };
        GenerateRequest {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            prompt: self.prompt,
            options: options.into_option(),
            system: self.system.filter(|s| !s.is_empty()),
            context: self.context.filter(|c| !c.is_empty()),
        }
    }
}

/// Body of `POST /inference/chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidInput(
                "messages must not be empty".to_string(),
            ));
        }
        check_temperature(self.temperature)?;
        check_max_tokens(self.max_tokens)
    }

    pub fn into_chat(self, default_model: &str) -> ChatRequest {
        let options = GenerationOptions {
            temperature: self.temperature,
            num_predict: self.max_tokens,
            ..Default::default()
        };
        ChatRequest {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            messages: self.messages,
            options: options.into_option(),
        }
    }
}

/// A single text or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

impl EmbeddingInput {
    pub fn into_texts(self) -> Vec<String> {
        match self {
            Self::One(text) => vec![text],
            Self::Many(texts) => texts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRequest {
    pub input: EmbeddingInput,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub description: String,
    pub health: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ollama_status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsResponse {
    pub collections: Vec<CollectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDeleteResponse {
    pub collection: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsQuery {
    pub since_minutes: Option<i64>,
}

fn default_error_limit() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorsQuery {
    #[serde(default = "default_error_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheClearQuery {
    pub prefix: Option<String>,
}
