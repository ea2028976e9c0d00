//! Error types for the Redis storage backend.
//!
//! Maps client and pool failures onto [`StorageError`] so the store client
//! retries the transient ones.

use deadpool_redis::PoolError;
use redis::{ErrorKind, RedisError};
use thiserror::Error;
use tinyolly_common_storage::StorageError;

/// Result type alias for Redis backend operations.
pub type Result<T> = std::result::Result<T, RedisStorageError>;

/// Errors specific to the Redis storage backend.
#[derive(Debug, Error)]
pub enum RedisStorageError {
    /// Command or protocol error from the server or client.
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// No pooled connection could be obtained.
    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// Invalid configuration, or a pool that could not be built from it.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RedisStorageError> for StorageError {
    fn from(err: RedisStorageError) -> Self {
        match err {
            RedisStorageError::Redis(source) => redis_error_to_storage_error(&source),
            RedisStorageError::Pool(PoolError::Timeout(kind)) => {
                tracing::debug!(?kind, "timed out waiting for a Redis connection");
                StorageError::timeout()
            },
            RedisStorageError::Pool(PoolError::Backend(source)) => redis_error_to_storage_error(&source),
            RedisStorageError::Pool(other) => StorageError::connection(other.to_string()),
            RedisStorageError::Config(message) => StorageError::internal(format!("Config: {message}")),
        }
    }
}

/// Converts a client error to a storage error.
///
/// Network failures and server states that clear on their own are
/// [`StorageError::Connection`] or [`StorageError::Timeout`] so they are
/// retried; everything else is final.
fn redis_error_to_storage_error(err: &RedisError) -> StorageError {
    if err.is_timeout() {
        return StorageError::timeout();
    }
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return StorageError::connection(err.to_string());
    }
    match err.kind() {
        ErrorKind::BusyLoadingError | ErrorKind::TryAgain | ErrorKind::ClusterDown | ErrorKind::MasterDown => {
            StorageError::connection(err.to_string())
        },
        ErrorKind::TypeError => StorageError::serialization(err.to_string()),
        _ => StorageError::internal(format!("Redis: {err}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: StorageError = RedisStorageError::Redis(RedisError::from(io)).into();
        assert!(err.is_transient(), "{err:?}");
    }

    #[test]
    fn test_loading_is_transient() {
        let source = RedisError::from((ErrorKind::BusyLoadingError, "loading dataset"));
        let err: StorageError = RedisStorageError::Redis(source).into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_type_errors_are_final() {
        let source = RedisError::from((ErrorKind::TypeError, "unexpected reply"));
        let err: StorageError = RedisStorageError::Redis(source).into();
        assert!(!err.is_transient());
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn test_config_errors_are_internal() {
        let err: StorageError = RedisStorageError::Config("bad".into()).into();
        assert!(matches!(err, StorageError::Internal { .. }));
    }
}
