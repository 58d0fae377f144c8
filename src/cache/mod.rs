//! Response cache keyed by a digest of the request parameters.
//!
//! A cache failure never fails a request: reads degrade to misses and
//! writes report `false`.

pub mod backend;
pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{CacheBackendKind, Settings};
use crate::error::{GatewayError, GatewayResult};

pub use backend::{BackendInfo, KvBackend, RedisBackend};
pub use memory::MemoryBackend;

pub const EMBEDDING_PREFIX: &str = "embedding";
pub const INFERENCE_PREFIX: &str = "inference";
pub const CHAT_PREFIX: &str = "chat";

/// Expiry, in seconds, for each kind of cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub default: u64,
    pub embedding: u64,
    pub inference: u64,
    pub chat: u64,
}

impl CacheTtl {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default: settings.cache_ttl,
            embedding: settings.cache_embedding_ttl,
            inference: settings.cache_inference_ttl,
            chat: settings.cache_chat_ttl,
        }
    }

    pub fn for_prefix(&self, prefix: &str) -> u64 {
        match prefix {
            EMBEDDING_PREFIX => self.embedding,
            INFERENCE_PREFIX => self.inference,
            CHAT_PREFIX => self.chat,
            _ => self.default,
        }
    }
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            default: 3600,
            embedding: 86400,
            inference: 3600,
            chat: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub enabled: bool,
    pub key_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
    pub memory_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CacheStats {
    fn disabled(error: Option<String>) -> Self {
        Self {
            enabled: false,
            key_count: 0,
            hits: 0,
            misses: 0,
            hit_rate_pct: 0.0,
            memory_used: 0,
            error,
        }
    }
}

/// Deterministic cache key: `{prefix}:{sha256 of canonical JSON}`.
///
/// Object keys are sorted at every depth, so two parameter sets that differ
/// only in field order produce the same key.
pub fn derive_key<P: Serialize + ?Sized>(prefix: &str, params: &P) -> GatewayResult<String> {
    let value = serde_json::to_value(params)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{}:{}", prefix, hex::encode(digest)))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub struct ResponseCache {
    backend: Option<Arc<dyn KvBackend>>,
    ttl: CacheTtl,
    degraded: AtomicBool,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn KvBackend>, ttl: CacheTtl) -> Self {
        Self {
            backend: Some(backend),
            ttl,
            degraded: AtomicBool::new(false),
        }
    }

    /// A cache that stores nothing and always misses.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            ttl: CacheTtl::default(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Builds the cache from settings. An unreachable backend at startup
    /// yields a disabled cache rather than an error.
    pub async fn connect(settings: &Settings) -> Self {
        if !settings.cache_enabled {
            tracing::info!("Response cache disabled by configuration");
            return Self::disabled();
        }

        let ttl = CacheTtl::from_settings(settings);
        match settings.cache_backend {
            CacheBackendKind::Memory => {
                tracing::info!("Using in-memory response cache");
                Self::new(Arc::new(MemoryBackend::new()), ttl)
            }
            CacheBackendKind::Redis => {
                match RedisBackend::connect(&settings.redis_url, settings.cache_timeout()).await {
                    Ok(backend) => Self::new(Arc::new(backend), ttl),
                    Err(e) => {
                        tracing::warn!(error = %e, "Cache backend unreachable, continuing without cache");
                        Self::disabled()
                    }
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn ttl_for(&self, prefix: &str) -> u64 {
        self.ttl.for_prefix(prefix)
    }

    fn report_failure(&self, operation: &str, err: &GatewayError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(operation, error = %err, "Cache backend failing, serving without cache");
        } else {
            tracing::debug!(operation, error = %err, "Cache operation failed");
        }
    }

    fn report_success(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("Cache backend recovered");
        }
    }

    pub async fn get<P, T>(&self, prefix: &str, params: &P) -> Option<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let backend = self.backend.as_ref()?;
        let key = match derive_key(prefix, params) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "Could not derive cache key");
                return None;
            }
        };

        let raw = match backend.get(&key).await {
            Ok(raw) => {
                self.report_success();
                raw
            }
            Err(e) => {
                self.report_failure("get", &e);
                None
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(%key, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        if value.is_some() {
            tracing::debug!(%key, "Cache hit");
            metrics::counter!("gateway_cache_hits_total", "cache_type" => prefix.to_string())
                .increment(1);
        } else {
            tracing::debug!(%key, "Cache miss");
            metrics::counter!("gateway_cache_misses_total", "cache_type" => prefix.to_string())
                .increment(1);
        }
        value
    }

    /// Stores `value` for `ttl_secs` (or the prefix default when `None`).
    /// Returns whether the entry was written.
    pub async fn set<P, T>(&self, prefix: &str, params: &P, value: &T, ttl_secs: Option<u64>) -> bool
    where
        P: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };

        let encoded = derive_key(prefix, params)
            .and_then(|key| Ok((key, serde_json::to_string(value)?)));
        let (key, payload) = match encoded {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "Could not encode cache entry");
                return false;
            }
        };

        let ttl = ttl_secs.unwrap_or_else(|| self.ttl_for(prefix));
        match backend.set_ex(&key, &payload, ttl).await {
            Ok(()) => {
                self.report_success();
                tracing::debug!(%key, ttl, "Cached response");
                true
            }
            Err(e) => {
                self.report_failure("set", &e);
                false
            }
        }
    }

    pub async fn delete<P: Serialize + ?Sized>(&self, prefix: &str, params: &P) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        let Ok(key) = derive_key(prefix, params) else {
            return false;
        };
        match backend.delete(&[key]).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                self.report_failure("delete", &e);
                false
            }
        }
    }

    /// Removes every entry under `prefix`, returning how many were removed.
    pub async fn clear_prefix(&self, prefix: &str) -> u64 {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };

        let result: GatewayResult<u64> = async {
            let keys = backend.keys_with_prefix(prefix).await?;
            backend.delete(&keys).await
        }
        .await;

        match result {
            Ok(removed) => {
                tracing::info!(prefix, removed, "Cleared cache prefix");
                removed
            }
            Err(e) => {
                self.report_failure("clear_prefix", &e);
                0
            }
        }
    }

    pub async fn clear_all(&self) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.flush().await {
            Ok(()) => {
                tracing::info!("Cleared entire cache");
                true
            }
            Err(e) => {
                self.report_failure("clear_all", &e);
                false
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let Some(backend) = self.backend.as_ref() else {
            return CacheStats::disabled(None);
        };

        match backend.info().await {
            Ok(info) => {
                let lookups = info.hits + info.misses;
                let hit_rate_pct = if lookups > 0 {
                    (info.hits as f64 / lookups as f64 * 10000.0).round() / 100.0
                } else {
                    0.0
                };
                CacheStats {
                    enabled: true,
                    key_count: info.keys,
                    hits: info.hits,
                    misses: info.misses,
                    hit_rate_pct,
                    memory_used: info.memory_used,
                    error: None,
                }
            }
            Err(e) => {
                self.report_failure("stats", &e);
                CacheStats::disabled(Some(e.to_string()))
            }
        }
    }
}
