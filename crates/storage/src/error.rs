//! Error types and result aliases.
//!
//! Two layers of errors exist in this crate:
//!
//! - [`StorageError`] is produced by [`StoreBackend`](crate::StoreBackend) implementations and the
//!   [`StoreClient`](crate::StoreClient). Backends map their native errors onto these variants.
//! - [`TelemetryError`] is produced by the [`TelemetryStore`](crate::TelemetryStore) facade and is
//!   what ingestion and query callers see.
//!
//! Configuration validation failures are reported as [`ConfigError`].
//!
//! # Example
//!
//! ```
//! use tinyolly_common_storage::{StorageError, StorageResult};
//!
//! fn fetch(_key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::connection("connection refused"))
//! }
//!
//! assert!(fetch("span:abc:def").unwrap_err().is_transient());
//! ```

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::codec::CodecError;

/// A shared error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for backing-store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for facade operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

// ───────────────────────────────────────────────────────────────────────────
// StorageError
// ───────────────────────────────────────────────────────────────────────────

/// Errors that can occur while talking to the backing store.
///
/// Errors preserve their source chain via the `#[source]` attribute. The enum
/// is `Clone` so a single failed computation can be handed to every caller
/// waiting on it.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Network or connection failure talking to the backing store.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// A single store operation exceeded its deadline.
    #[error("Operation timeout")]
    Timeout,

    /// The store could not be reached within the retry budget.
    #[error("Store unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        /// Number of attempts made, including the first one.
        attempts: u32,
        /// Description of the last transient error observed.
        last_error: String,
    },

    /// The store returned data of an unexpected shape.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Backend-specific failure that does not fit the other categories.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A key or value exceeded a configured size limit.
    #[error("{kind} size {actual} exceeds limit {limit}")]
    SizeLimitExceeded {
        /// Which limit was violated (`"key"` or `"value"`).
        kind: String,
        /// Actual size in bytes.
        actual: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },
}

impl StorageError {
    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::Unavailable { attempts, last_error: last_error.into() }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `SizeLimitExceeded` error.
    #[must_use]
    pub fn size_limit_exceeded(kind: impl Into<String>, actual: usize, limit: usize) -> Self {
        Self::SizeLimitExceeded { kind: kind.into(), actual, limit }
    }

    /// Returns `true` if retrying the same operation may succeed.
    ///
    /// Connection failures and per-attempt timeouts are transient. An
    /// exhausted retry budget is not: the client already retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Short human-readable detail, used in logs and retry bookkeeping.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Connection { message, .. }
            | Self::Serialization { message, .. }
            | Self::Internal { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// ConfigError
// ───────────────────────────────────────────────────────────────────────────

/// Configuration validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Offending field.
        field: &'static str,
        /// Supplied value, formatted.
        value: String,
        /// Minimum allowed value, formatted.
        min: String,
    },

    /// A value must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Offending field.
        field: &'static str,
        /// Supplied value, formatted.
        value: String,
    },

    /// Two fields violate an ordering constraint.
    #[error("{field} ({value}) must not exceed {other} ({other_value})")]
    InvalidRelation {
        /// Field that is too large.
        field: &'static str,
        /// Its value, formatted.
        value: String,
        /// Field it is compared with.
        other: &'static str,
        /// That field's value, formatted.
        other_value: String,
    },

    /// A required string field was empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Offending field.
        field: &'static str,
    },
}

// ───────────────────────────────────────────────────────────────────────────
// TelemetryError
// ───────────────────────────────────────────────────────────────────────────

/// Failures surfaced by the [`TelemetryStore`](crate::TelemetryStore) facade.
///
/// "Not found" is never an error: lookups return `Option::None` or an empty
/// page.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    /// The record is malformed and was rejected before any write.
    #[error("invalid record: {reason}")]
    InvalidRecord {
        /// What was wrong with it.
        reason: String,
    },

    /// The query parameters are malformed (for example, a bad page token).
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// What was wrong with it.
        reason: String,
    },

    /// The backing store could not be reached within the retry budget.
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        /// The exhausted store error.
        #[source]
        source: StorageError,
    },

    /// The record was persisted but one or more index updates failed.
    ///
    /// The record is readable by key and queued for reconciliation. Indexed
    /// queries may miss it until then.
    #[error("record {record_key} persisted but index is inconsistent: {reason}")]
    IndexInconsistent {
        /// Key of the persisted record.
        record_key: String,
        /// Last index failure.
        reason: String,
    },

    /// The operation exceeded its overall time budget.
    #[error("{operation} exceeded time budget of {}ms", budget.as_millis())]
    Timeout {
        /// Name of the operation that timed out.
        operation: &'static str,
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// Stored bytes could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Non-transient store failure.
    #[error(transparent)]
    Storage(StorageError),
}

impl TelemetryError {
    /// Creates an `InvalidRecord` error.
    #[must_use]
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord { reason: reason.into() }
    }

    /// Creates an `InvalidQuery` error.
    #[must_use]
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery { reason: reason.into() }
    }

    /// Returns `true` if the caller may retry the request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. })
    }
}

impl From<StorageError> for TelemetryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable { .. } | StorageError::Connection { .. } => {
                Self::StoreUnavailable { source: err }
            },
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::connection("refused").is_transient());
        assert!(StorageError::timeout().is_transient());
        assert!(!StorageError::unavailable(4, "refused").is_transient());
        assert!(!StorageError::internal("bad").is_transient());
        assert!(!StorageError::serialization("bad").is_transient());
        assert!(!StorageError::size_limit_exceeded("key", 10, 5).is_transient());
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StorageError::connection_with_source("lost connection", io);
        let source = err.source().expect("source should be present");
        assert!(source.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_unavailable_display() {
        let err = StorageError::unavailable(4, "connection refused");
        assert_eq!(err.to_string(), "Store unavailable after 4 attempts: connection refused");
    }

    #[test]
    fn test_detail_uses_message() {
        assert_eq!(StorageError::internal("boom").detail(), "boom");
        assert_eq!(StorageError::timeout().detail(), "Operation timeout");
    }

    #[test]
    fn test_storage_error_maps_to_store_unavailable() {
        let err: TelemetryError = StorageError::unavailable(3, "refused").into();
        assert!(matches!(err, TelemetryError::StoreUnavailable { .. }));
        assert!(err.is_retryable());

        let err: TelemetryError = StorageError::internal("bad reply").into();
        assert!(matches!(err, TelemetryError::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = TelemetryError::Timeout {
            operation: "query_logs",
            budget: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "query_logs exceeded time budget of 250ms");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum { field: "max_entries", value: "0".into(), min: "1".into() };
        assert_eq!(err.to_string(), "max_entries must be at least 1, got 0");
    }
}
