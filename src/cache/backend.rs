use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};

use crate::error::{GatewayError, GatewayResult};

const SERVICE: &str = "cache";

/// Counters reported by the backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendInfo {
    pub keys: u64,
    pub hits: u64,
    pub misses: u64,
    pub memory_used: u64,
}

/// Minimal key-value surface the response cache needs.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    /// Stores `value` under `key`. A `ttl_secs` of zero means no expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> GatewayResult<()>;

    /// Returns how many of `keys` existed.
    async fn delete(&self, keys: &[String]) -> GatewayResult<u64>;

    /// All keys of the form `{prefix}:*`.
    async fn keys_with_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>>;

    async fn flush(&self) -> GatewayResult<()>;

    async fn info(&self) -> GatewayResult<BackendInfo>;
}

/// Redis-backed store. Every command is bounded by `timeout`.
pub struct RedisBackend {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisBackend {
    pub async fn connect(url: &str, timeout: Duration) -> GatewayResult<Self> {
        tracing::info!("Connecting to Redis at {}", url);
        let client = Client::open(url).map_err(|e| GatewayError::unavailable(SERVICE, e))?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| GatewayError::unavailable(SERVICE, "connection timed out"))?
            .map_err(|e| GatewayError::unavailable(SERVICE, e))?;

        let backend = Self { conn, timeout };
        let _: String = backend.run(&redis::cmd("PING")).await?;
        tracing::info!("Connected to Redis cache");
        Ok(backend)
    }

    async fn run<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> GatewayResult<T> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<T> =
            match tokio::time::timeout(self.timeout, cmd.query_async(&mut conn)).await {
                Ok(result) => result,
                Err(_) => return Err(GatewayError::unavailable(SERVICE, "command timed out")),
            };
        result.map_err(|e| GatewayError::unavailable(SERVICE, e))
    }
}

/// Escapes glob metacharacters so a prefix matches literally in SCAN.
fn escape_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn parse_info(raw: &str) -> BackendInfo {
    let mut info = BackendInfo::default();
    for line in raw.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim().parse::<u64>().unwrap_or(0);
        match field {
            "keyspace_hits" => info.hits = value,
            "keyspace_misses" => info.misses = value,
            "used_memory" => info.memory_used = value,
            _ => {}
        }
    }
    info
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> GatewayResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        self.run(&cmd).await
    }

    async fn delete(&self, keys: &[String]) -> GatewayResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run(redis::cmd("DEL").arg(keys)).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>> {
        let pattern = format!("{}:*", escape_pattern(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(&pattern).arg("COUNT").arg(500);
            let (next, batch): (u64, Vec<String>) = self.run(&cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn flush(&self) -> GatewayResult<()> {
        self.run(&redis::cmd("FLUSHDB")).await
    }

    async fn info(&self) -> GatewayResult<BackendInfo> {
        let raw: String = self.run(&redis::cmd("INFO")).await?;
        let keys: u64 = self.run(&redis::cmd("DBSIZE")).await?;
        Ok(BackendInfo {
            keys,
            ..parse_info(&raw)
        })
    }
}
