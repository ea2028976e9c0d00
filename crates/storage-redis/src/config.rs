//! Configuration for the Redis storage backend.
//!
//! [`RedisBackendConfig`] sets the server URL, connection pool bounds and an
//! optional key prefix that isolates one deployment's keys from others
//! sharing the same server.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RedisStorageError, Result};

/// Default maximum pool size.
const DEFAULT_POOL_SIZE: usize = 16;

/// Default time to wait for a pooled connection.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time to establish a new connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`RedisBackend`](crate::RedisBackend).
///
/// # Example
///
/// ```
/// use tinyolly_common_storage_redis::RedisBackendConfig;
///
/// let config = RedisBackendConfig::builder()
///     .url("redis://localhost:6379/0")
///     .pool_size(32)
///     .key_prefix("tinyolly")
///     .build()?;
/// assert_eq!(config.key_prefix(), Some("tinyolly"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisBackendConfig {
    /// Server URL (`redis://` or `rediss://`).
    pub(crate) url: String,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_size")]
    pub(crate) pool_size: usize,

    /// Time to wait for a free pooled connection.
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub(crate) wait_timeout: Duration,

    /// Time to establish a new connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,

    /// Prefix prepended to every key, separated by `:`.
    #[serde(default)]
    pub(crate) key_prefix: Option<String>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_wait_timeout() -> Duration {
    DEFAULT_WAIT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

#[bon::bon]
impl RedisBackendConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Optional Fields
    ///
    /// * `pool_size` - Maximum pooled connections (default: 16).
    /// * `wait_timeout` - Wait for a pooled connection (default: 2 seconds).
    /// * `connect_timeout` - Connection establishment timeout (default: 5 seconds).
    /// * `key_prefix` - Key namespace (default: none).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The URL is empty or does not use the `redis://`, `rediss://` or `unix://` scheme
    /// - `pool_size` is zero
    /// - Either timeout is zero
    /// - `key_prefix` is empty or contains glob metacharacters
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(default = DEFAULT_POOL_SIZE)] pool_size: usize,
        #[builder(default = DEFAULT_WAIT_TIMEOUT)] wait_timeout: Duration,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(into)] key_prefix: Option<String>,
    ) -> Result<Self> {
        let config = Self { url, pool_size, wait_timeout, connect_timeout, key_prefix };
        config.validate()?;
        Ok(config)
    }

    /// Checks field constraints. Run after deserializing.
    ///
    /// # Errors
    ///
    /// See [`RedisBackendConfig::new`].
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(RedisStorageError::Config("url cannot be empty".into()));
        }
        if !["redis://", "rediss://", "unix://"].iter().any(|scheme| self.url.starts_with(scheme)) {
            return Err(RedisStorageError::Config(format!("unsupported url scheme: {}", self.url)));
        }
        if self.pool_size == 0 {
            return Err(RedisStorageError::Config("pool_size must be positive".into()));
        }
        if self.wait_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(RedisStorageError::Config("timeouts must be positive".into()));
        }
        if let Some(prefix) = &self.key_prefix {
            if prefix.is_empty() {
                return Err(RedisStorageError::Config("key_prefix cannot be empty".into()));
            }
            if prefix.contains(['*', '?', '[', ']', '\\']) {
                return Err(RedisStorageError::Config(format!(
                    "key_prefix contains glob metacharacters: {prefix}"
                )));
            }
        }
        Ok(())
    }

    /// Returns the server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the maximum pool size.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the pooled connection wait timeout.
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Returns the connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the key prefix if configured.
    #[must_use]
    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = RedisBackendConfig::builder().url("redis://localhost").build().unwrap();
        assert_eq!(config.pool_size(), DEFAULT_POOL_SIZE);
        assert_eq!(config.wait_timeout(), DEFAULT_WAIT_TIMEOUT);
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.key_prefix(), None);
    }

    #[rstest]
    #[case::empty_url("", 4, Some("p"))]
    #[case::bad_scheme("http://localhost", 4, None)]
    #[case::zero_pool("redis://localhost", 0, None)]
    #[case::empty_prefix("redis://localhost", 4, Some(""))]
    #[case::glob_prefix("redis://localhost", 4, Some("team*"))]
    fn test_builder_rejects(#[case] url: &str, #[case] pool_size: usize, #[case] prefix: Option<&str>) {
        let result = RedisBackendConfig::builder()
            .url(url)
            .pool_size(pool_size)
            .maybe_key_prefix(prefix)
            .build();
        assert!(matches!(result, Err(RedisStorageError::Config(_))), "{result:?}");
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let config: RedisBackendConfig = serde_json::from_str(
            r#"{"url": "rediss://cache:6380", "wait_timeout": "500ms", "key_prefix": "olly"}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.wait_timeout(), Duration::from_millis(500));
        assert_eq!(config.pool_size(), DEFAULT_POOL_SIZE);
        assert_eq!(config.key_prefix(), Some("olly"));
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result = serde_json::from_str::<RedisBackendConfig>(r#"{"url": "redis://x", "pool": 3}"#);
        assert!(result.is_err());
    }
}
