use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::backend::{BackendInfo, KvBackend};
use crate::error::{GatewayError, GatewayResult};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store for tests and single-node deployments without Redis.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> GatewayResult<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| GatewayError::Internal("cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        let value = match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };

        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> GatewayResult<()> {
        let expires_at = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> GatewayResult<u64> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>> {
        let now = Instant::now();
        let pattern = format!("{}:", prefix);
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(&pattern) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn flush(&self) -> GatewayResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    async fn info(&self) -> GatewayResult<BackendInfo> {
        let now = Instant::now();
        let entries = self.lock()?;
        let live = entries.values().filter(|entry| entry.is_live(now));
        let (keys, memory_used) = live.fold((0u64, 0u64), |(count, bytes), entry| {
            (count + 1, bytes + entry.value.len() as u64)
        });

        Ok(BackendInfo {
            keys,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_used,
        })
    }
}
