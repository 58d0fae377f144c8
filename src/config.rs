use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

/// Which store backs the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Redis,
    Memory,
}

/// Which store holds RAG collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackendKind {
    Qdrant,
    Memory,
}

/// Application settings, read from environment variables (and `.env`).
///
/// Variable names are the upper-cased field names, e.g. `OLLAMA_BASE_URL`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Comma-separated list of accepted `X-API-Key` values.
    pub api_keys: String,

    pub ollama_base_url: String,
    pub default_inference_model: String,
    pub default_embedding_model: String,

    pub host: String,
    pub port: u16,
    pub log_level: String,

    // RAG
    pub vector_backend: VectorBackendKind,
    pub qdrant_url: String,
    pub qdrant_api_key: String,
    pub default_collection: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k_results: u64,

    // Cache
    pub cache_backend: CacheBackendKind,
    pub redis_url: String,
    pub cache_enabled: bool,
    pub cache_ttl: u64,
    pub cache_embedding_ttl: u64,
    pub cache_inference_ttl: u64,
    pub cache_chat_ttl: u64,

    // Monitoring
    pub monitoring_enabled: bool,
    pub metrics_retention_hours: i64,
    pub alert_error_rate_threshold: f64,
    pub alert_response_time_threshold: f64,
    /// Seconds between background alert checks; 0 disables the monitor.
    pub alert_check_interval_secs: u64,

    // Outbound timeouts, in seconds
    pub generation_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub cache_timeout_secs: u64,
    pub vector_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_keys: "changeme".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            default_inference_model: "qwen2.5:7b".to_string(),
            default_embedding_model: "nomic-embed-text".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            vector_backend: VectorBackendKind::Qdrant,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: String::new(),
            default_collection: "documents".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k_results: 5,
            cache_backend: CacheBackendKind::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            cache_enabled: true,
            cache_ttl: 3600,
            cache_embedding_ttl: 86400,
            cache_inference_ttl: 3600,
            cache_chat_ttl: 3600,
            monitoring_enabled: true,
            metrics_retention_hours: 168,
            alert_error_rate_threshold: 0.1,
            alert_response_time_threshold: 5.0,
            alert_check_interval_secs: 60,
            generation_timeout_secs: 300,
            embedding_timeout_secs: 60,
            health_timeout_secs: 5,
            cache_timeout_secs: 2,
            vector_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Loads `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::load(Environment::default().try_parsing(true))
    }

    /// Loads settings from an explicit variable map instead of the process
    /// environment.
    pub fn from_source(vars: HashMap<String, String>) -> Result<Self> {
        Self::load(Environment::default().try_parsing(true).source(Some(vars)))
    }

    fn load(env: Environment) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if settings.chunk_size == 0 {
            anyhow::bail!("CHUNK_SIZE must be greater than zero");
        }
        Ok(settings)
    }

    pub fn valid_api_keys(&self) -> Vec<String> {
        self.api_keys
            .split(',')
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn qdrant_api_key(&self) -> Option<&str> {
        Some(self.qdrant_api_key.as_str()).filter(|key| !key.is_empty())
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }

    pub fn vector_timeout(&self) -> Duration {
        Duration::from_secs(self.vector_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = Settings::from_source(HashMap::new()).unwrap();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.chunk_size, 1000);
        assert_eq!(settings.chunk_overlap, 200);
        assert_eq!(settings.cache_embedding_ttl, 86400);
        assert_eq!(settings.vector_backend, VectorBackendKind::Qdrant);
        assert_eq!(settings.cache_backend, CacheBackendKind::Redis);
    }

    #[test]
    fn test_overrides_from_variables() {
        let settings = Settings::from_source(vars(&[
            ("PORT", "9100"),
            ("DEFAULT_COLLECTION", "manuals"),
            ("CACHE_ENABLED", "false"),
            ("VECTOR_BACKEND", "memory"),
        ]))
        .unwrap();
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.default_collection, "manuals");
        assert!(!settings.cache_enabled);
        assert_eq!(settings.vector_backend, VectorBackendKind::Memory);
    }

    #[test]
    fn test_api_keys_are_split_and_trimmed() {
        let settings = Settings::from_source(vars(&[("API_KEYS", "alpha, beta,,gamma ")])).unwrap();
        assert_eq!(settings.valid_api_keys(), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_backend_kinds_rejected_for_the_wrong_store() {
        assert!(Settings::from_source(vars(&[("CACHE_BACKEND", "qdrant")])).is_err());
        assert!(Settings::from_source(vars(&[("VECTOR_BACKEND", "redis")])).is_err());

        let settings = Settings::from_source(vars(&[("CACHE_BACKEND", "memory")])).unwrap();
        assert_eq!(settings.cache_backend, CacheBackendKind::Memory);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(Settings::from_source(vars(&[("CHUNK_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_empty_qdrant_key_is_none() {
        let settings = Settings::default();
        assert!(settings.qdrant_api_key().is_none());
    }
}
