//! [`StoreBackend`] over a pooled Redis (or Valkey) connection.

use std::{
    fmt,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tinyolly_common_storage::{
    HealthMetadata, HealthProbe, HealthStatus, KeyValue, ScanPage, StorageError, StorageResult,
    StoreBackend,
};

use crate::{
    config::RedisBackendConfig,
    error::{RedisStorageError, Result},
};

/// Redis-backed [`StoreBackend`].
///
/// Values are stored as plain strings; TTLs map to `SET .. PX` and
/// `PEXPIREAT`. Prefix scans use `SCAN .. MATCH` followed by `MGET`, so a
/// scan page costs two round trips and may repeat keys when the server
/// rehashes mid-scan.
///
/// The backend is cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    key_prefix: Option<String>,
}

impl RedisBackend {
    /// Builds the connection pool and verifies the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`RedisStorageError::Config`] if the pool cannot be built, or
    /// the connection error if the server is unreachable.
    pub async fn connect(config: RedisBackendConfig) -> Result<Self> {
        let backend = Self::from_config(&config)?;
        let mut conn = backend.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        tracing::info!(
            pool_size = config.pool_size(),
            key_prefix = config.key_prefix(),
            "connected to Redis"
        );
        Ok(backend)
    }

    /// Builds the connection pool without contacting the server.
    ///
    /// Connections are opened lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RedisStorageError::Config`] if the configuration is invalid
    /// or the pool cannot be built.
    pub fn from_config(config: &RedisBackendConfig) -> Result<Self> {
        config.validate()?;
        let pool = Config::from_url(config.url())
            .builder()
            .map_err(|e| RedisStorageError::Config(e.to_string()))?
            .max_size(config.pool_size())
            .wait_timeout(Some(config.wait_timeout()))
            .create_timeout(Some(config.connect_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| RedisStorageError::Config(e.to_string()))?;
        Ok(Self { pool, key_prefix: config.key_prefix().map(str::to_owned) })
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    fn prefixed_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_owned(),
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        match &self.key_prefix {
            Some(prefix) => {
                key.strip_prefix(prefix.as_str()).and_then(|k| k.strip_prefix(':')).unwrap_or(key)
            },
            None => key,
        }
    }

    async fn scan_page(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ScanPage> {
        let cursor = match cursor {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| RedisStorageError::Config(format!("invalid scan cursor: {raw}")))?,
            None => 0,
        };
        let pattern = format!("{}*", escape_glob(&self.prefixed_key(prefix)));
        let mut conn = self.conn().await?;

        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(limit.max(1))
            .query_async(&mut *conn)
            .await?;

        let entries = if keys.is_empty() {
            Vec::new()
        } else {
            let values: Vec<Option<Vec<u8>>> =
                redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await?;
            // Keys that expired between SCAN and MGET come back as nil.
            keys.iter()
                .zip(values)
                .filter_map(|(key, value)| {
                    value.map(|value| KeyValue::new(self.strip_prefix(key), Bytes::from(value)))
                })
                .collect()
        };

        Ok(ScanPage { entries, next_cursor: (next != 0).then(|| next.to_string()) })
    }
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .field("pool_size", &status.size)
            .field("pool_max_size", &status.max_size)
            .finish_non_exhaustive()
    }
}

/// Escapes Redis glob metacharacters so `MATCH` treats the prefix literally.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Clamps a TTL to whole milliseconds, never rounding a positive TTL to zero.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl StoreBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.prefixed_key(key))
            .query_async(&mut *conn)
            .await
            .map_err(RedisStorageError::from)?;
        Ok(value.map(Bytes::from))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let key = self.prefixed_key(key);
        let result = match ttl {
            Some(ttl) if ttl.is_zero() => {
                redis::cmd("DEL").arg(&key).query_async::<()>(&mut *conn).await
            },
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value.as_ref())
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async::<()>(&mut *conn)
                    .await
            },
            // A plain SET discards any previous TTL.
            None => redis::cmd("SET").arg(&key).arg(value.as_ref()).query_async::<()>(&mut *conn).await,
        };
        result.map_err(|e| RedisStorageError::from(e).into())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.prefixed_key(key))
            .query_async(&mut *conn)
            .await
            .map_err(RedisStorageError::from)?;
        Ok(removed > 0)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        Ok(self.scan_page(prefix, cursor, limit).await?)
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        // A past instant makes the server delete the key.
        let applied: i64 = redis::cmd("PEXPIREAT")
            .arg(self.prefixed_key(key))
            .arg(at.timestamp_millis())
            .query_async(&mut *conn)
            .await
            .map_err(RedisStorageError::from)?;
        Ok(applied == 1)
    }

    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        let start = Instant::now();
        let mut conn = self.conn().await?;
        let reply: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(RedisStorageError::from)?;
        drop(conn);

        let status = self.pool.status();
        let metadata = HealthMetadata::new(start.elapsed(), self.name())
            .with_detail("probe", probe)
            .with_detail("pool_size", status.size)
            .with_detail("pool_available", status.available)
            .with_detail("pool_max_size", status.max_size);
        if reply != "PONG" {
            return Err(StorageError::connection(format!("unexpected PING reply: {reply}")));
        }
        if status.waiting > 0 && probe == HealthProbe::Readiness {
            return Ok(HealthStatus::degraded(
                metadata,
                format!("{} task(s) waiting for a connection", status.waiting),
            ));
        }
        Ok(HealthStatus::healthy(metadata))
    }
}
