//! Configuration for the storage engine.
//!
//! [`StorageConfig`] groups one section per component. Every section
//! deserializes with serde (durations in humantime form such as `"30m"` or
//! `"250ms"`). Every field has a default, so an empty document yields a
//! working configuration. Programmatic construction goes through `bon`
//! builders. Sections whose fields constrain each other validate in their
//! builder and in [`StorageConfig::validate`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tinyolly_common_storage::{RetentionConfig, StorageConfig};
//!
//! let config = StorageConfig::builder()
//!     .retention(
//!         RetentionConfig::builder()
//!             .span_window(Duration::from_secs(15 * 60))
//!             .max_records(100_000)
//!             .build()?,
//!     )
//!     .build();
//! config.validate()?;
//! # Ok::<(), tinyolly_common_storage::ConfigError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    cache::CacheConfig,
    error::ConfigError,
    model::{RecordKind, Timestamp},
    size_limits::SizeLimits,
};

// ───────────────────────────────────────────────────────────────────────────
// Defaults
// ───────────────────────────────────────────────────────────────────────────

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_in_flight() -> usize {
    64
}

fn default_scan_page_size() -> usize {
    500
}

fn default_bucket_width() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_buckets_per_lookup() -> u64 {
    2_048
}

fn default_index_retries() -> u32 {
    2
}

fn default_span_window() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_log_window() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_metric_window() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_page_size() -> usize {
    100
}

fn default_max_page_size() -> usize {
    1_000
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_min_call_count() -> u64 {
    1
}

fn default_max_clock_skew() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_min_timestamp() -> Timestamp {
    // 2000-01-01T00:00:00Z
    Timestamp::from_secs(946_684_800)
}

fn default_compression_threshold() -> usize {
    512
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_decoded_size() -> usize {
    8 * 1024 * 1024
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::MustBePositive { field, value: format!("{value:?}") });
    }
    Ok(())
}

fn at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum {
            field,
            value: value.to_string(),
            min: min.to_string(),
        });
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// RetryConfig
// ───────────────────────────────────────────────────────────────────────────

/// Retry policy for transient backing-store failures.
///
/// An operation is attempted at most `max_retries + 1` times. Between
/// attempts the client sleeps `min(initial_backoff * 2^attempt, max_backoff)`
/// plus up to 50% jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    /// Upper bound on the un-jittered delay.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

#[bon::bon]
impl RetryConfig {
    /// Creates a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial_backoff` is zero or exceeds
    /// `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = default_max_retries())] max_retries: u32,
        #[builder(default = default_initial_backoff())] initial_backoff: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Checks field constraints.
    ///
    /// # Errors
    ///
    /// See [`RetryConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("initial_backoff", self.initial_backoff)?;
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidRelation {
                field: "initial_backoff",
                value: format!("{:?}", self.initial_backoff),
                other: "max_backoff",
                other_value: format!("{:?}", self.max_backoff),
            });
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// ClientConfig
// ───────────────────────────────────────────────────────────────────────────

/// Settings for the [`StoreClient`](crate::StoreClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Deadline for each individual store attempt.
    #[serde(with = "humantime_serde", default = "default_op_timeout")]
    #[builder(default = default_op_timeout())]
    pub op_timeout: Duration,
    /// Deadline for health probes.
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    #[builder(default = default_health_timeout())]
    pub health_timeout: Duration,
    /// Maximum concurrently outstanding store operations. Callers beyond the
    /// bound wait for a slot.
    #[serde(default = "default_max_in_flight")]
    #[builder(default = default_max_in_flight())]
    pub max_in_flight: usize,
    /// Keys fetched per prefix-scan page.
    #[serde(default = "default_scan_page_size")]
    #[builder(default = default_scan_page_size())]
    pub scan_page_size: usize,
    /// Retry policy for transient failures.
    #[serde(default)]
    #[builder(default)]
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Checks field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero timeouts or bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("op_timeout", self.op_timeout)?;
        positive("health_timeout", self.health_timeout)?;
        at_least("max_in_flight", self.max_in_flight as u64, 1)?;
        at_least("scan_page_size", self.scan_page_size as u64, 1)?;
        self.retry.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

// ───────────────────────────────────────────────────────────────────────────
// IndexConfig
// ───────────────────────────────────────────────────────────────────────────

/// Settings for the [`IndexManager`](crate::IndexManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Width of a time bucket. Changing it orphans existing bucketed index
    /// members until they expire.
    #[serde(with = "humantime_serde", default = "default_bucket_width")]
    #[builder(default = default_bucket_width())]
    pub bucket_width: Duration,
    /// Bounded ranges spanning more buckets than this fall back to a single
    /// prefix scan.
    #[serde(default = "default_max_buckets_per_lookup")]
    #[builder(default = default_max_buckets_per_lookup())]
    pub max_buckets_per_lookup: u64,
    /// Extra attempts the facade makes for failed index writes before it
    /// reports the record as index-inconsistent.
    #[serde(default = "default_index_retries")]
    #[builder(default = default_index_retries())]
    pub index_retries: u32,
}

impl IndexConfig {
    /// Checks field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the bucket width is shorter than a
    /// millisecond or the bucket bound is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width < Duration::from_millis(1) {
            return Err(ConfigError::BelowMinimum {
                field: "bucket_width",
                value: format!("{:?}", self.bucket_width),
                min: "1ms".into(),
            });
        }
        at_least("max_buckets_per_lookup", self.max_buckets_per_lookup, 1)
    }

    /// Bucket containing `ts`.
    #[must_use]
    pub fn bucket_of(&self, ts: Timestamp) -> u64 {
        let width = crate::model::duration_nanos(self.bucket_width).max(1);
        ts.as_nanos() / width
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

// ───────────────────────────────────────────────────────────────────────────
// RetentionConfig
// ───────────────────────────────────────────────────────────────────────────

/// Retention windows and capacity ceilings.
///
/// A record whose timestamp equals `now - window` is retained; anything older
/// is removed by the next sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// How long spans are kept.
    #[serde(with = "humantime_serde", default = "default_span_window")]
    pub span_window: Duration,
    /// How long logs are kept.
    #[serde(with = "humantime_serde", default = "default_log_window")]
    pub log_window: Duration,
    /// How long metric samples are kept.
    #[serde(with = "humantime_serde", default = "default_metric_window")]
    pub metric_window: Duration,
    /// Added to the window for the store-side TTL, so the sweep normally runs
    /// before the store expires anything on its own.
    #[serde(with = "humantime_serde", default = "default_grace")]
    pub grace: Duration,
    /// Ceiling on stored record count.
    #[serde(default)]
    pub max_records: Option<u64>,
    /// Ceiling on summed encoded record bytes.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    /// Period of the background maintenance task.
    #[serde(with = "humantime_serde", default = "default_maintenance_interval")]
    pub maintenance_interval: Duration,
}

#[bon::bon]
impl RetentionConfig {
    /// Creates validated retention settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero windows, a zero maintenance interval
    /// or zero capacity ceilings.
    #[builder]
    pub fn new(
        #[builder(default = default_span_window())] span_window: Duration,
        #[builder(default = default_log_window())] log_window: Duration,
        #[builder(default = default_metric_window())] metric_window: Duration,
        #[builder(default = default_grace())] grace: Duration,
        max_records: Option<u64>,
        max_bytes: Option<u64>,
        #[builder(default = default_maintenance_interval())] maintenance_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            span_window,
            log_window,
            metric_window,
            grace,
            max_records,
            max_bytes,
            maintenance_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks field constraints.
    ///
    /// # Errors
    ///
    /// See [`RetentionConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("span_window", self.span_window)?;
        positive("log_window", self.log_window)?;
        positive("metric_window", self.metric_window)?;
        positive("maintenance_interval", self.maintenance_interval)?;
        if let Some(max) = self.max_records {
            at_least("max_records", max, 1)?;
        }
        if let Some(max) = self.max_bytes {
            at_least("max_bytes", max, 1)?;
        }
        Ok(())
    }

    /// Retention window for a record kind.
    #[must_use]
    pub fn window(&self, kind: RecordKind) -> Duration {
        match kind {
            RecordKind::Span => self.span_window,
            RecordKind::Log => self.log_window,
            RecordKind::Metric => self.metric_window,
        }
    }

    /// Oldest timestamp still retained at `now`.
    #[must_use]
    pub fn cutoff(&self, kind: RecordKind, now: Timestamp) -> Timestamp {
        now.saturating_sub(self.window(kind))
    }

    /// Wall-clock instant at which a record stops being retained.
    #[must_use]
    pub fn expires_at(&self, kind: RecordKind, ts: Timestamp) -> Timestamp {
        ts.saturating_add(self.window(kind))
    }

    /// Store-side TTL for a record written at `now` with timestamp `ts`.
    #[must_use]
    pub fn store_ttl(&self, kind: RecordKind, ts: Timestamp, now: Timestamp) -> Duration {
        self.expires_at(kind, ts).saturating_add(self.grace).duration_since(now)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            span_window: default_span_window(),
            log_window: default_log_window(),
            metric_window: default_metric_window(),
            grace: default_grace(),
            max_records: None,
            max_bytes: None,
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// QueryConfig
// ───────────────────────────────────────────────────────────────────────────

/// Query limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Page size used when a query does not specify one.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    /// Upper bound on any requested page size.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Overall time budget for a single query.
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    pub query_timeout: Duration,
    /// Service-map edges with fewer calls are omitted.
    #[serde(default = "default_min_call_count")]
    pub min_call_count: u64,
}

#[bon::bon]
impl QueryConfig {
    /// Creates validated query limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a page size or the timeout is zero, or the
    /// default page size exceeds the maximum.
    #[builder]
    pub fn new(
        #[builder(default = default_page_size())] default_page_size: usize,
        #[builder(default = default_max_page_size())] max_page_size: usize,
        #[builder(default = default_query_timeout())] query_timeout: Duration,
        #[builder(default = default_min_call_count())] min_call_count: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self { default_page_size, max_page_size, query_timeout, min_call_count };
        config.validate()?;
        Ok(config)
    }

    /// Checks field constraints.
    ///
    /// # Errors
    ///
    /// See [`QueryConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("default_page_size", self.default_page_size as u64, 1)?;
        at_least("max_page_size", self.max_page_size as u64, 1)?;
        positive("query_timeout", self.query_timeout)?;
        if self.default_page_size > self.max_page_size {
            return Err(ConfigError::InvalidRelation {
                field: "default_page_size",
                value: self.default_page_size.to_string(),
                other: "max_page_size",
                other_value: self.max_page_size.to_string(),
            });
        }
        Ok(())
    }

    /// Effective page size for a requested limit.
    #[must_use]
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_page_size).clamp(1, self.max_page_size)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            query_timeout: default_query_timeout(),
            min_call_count: default_min_call_count(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// IngestConfig
// ───────────────────────────────────────────────────────────────────────────

/// Validation applied to incoming records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// How far in the future a record timestamp may be.
    #[serde(with = "humantime_serde", default = "default_max_clock_skew")]
    #[builder(default = default_max_clock_skew())]
    pub max_clock_skew: Duration,
    /// Earliest plausible record timestamp.
    #[serde(default = "default_min_timestamp")]
    #[builder(default = default_min_timestamp())]
    pub min_timestamp: Timestamp,
    /// Key and encoded-value size limits.
    #[serde(default)]
    #[builder(default)]
    pub size_limits: SizeLimits,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

// ───────────────────────────────────────────────────────────────────────────
// CodecConfig
// ───────────────────────────────────────────────────────────────────────────

/// Settings for the [`Codec`](crate::Codec).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct CodecConfig {
    /// Payloads at least this large are zstd-compressed.
    #[serde(default = "default_compression_threshold")]
    #[builder(default = default_compression_threshold())]
    pub compression_threshold: usize,
    /// zstd compression level.
    #[serde(default = "default_compression_level")]
    #[builder(default = default_compression_level())]
    pub compression_level: i32,
    /// Largest payload accepted when decompressing.
    #[serde(default = "default_max_decoded_size")]
    #[builder(default = default_max_decoded_size())]
    pub max_decoded_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

// ───────────────────────────────────────────────────────────────────────────
// StorageConfig
// ───────────────────────────────────────────────────────────────────────────

/// Top-level configuration for [`TelemetryStore`](crate::TelemetryStore).
#[derive(Debug, Clone, Default, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Store client settings.
    #[serde(default)]
    #[builder(default)]
    pub client: ClientConfig,
    /// Read-through cache settings.
    #[serde(default)]
    #[builder(default)]
    pub cache: CacheConfig,
    /// Index settings.
    #[serde(default)]
    #[builder(default)]
    pub index: IndexConfig,
    /// Retention settings.
    #[serde(default)]
    #[builder(default)]
    pub retention: RetentionConfig,
    /// Query limits.
    #[serde(default)]
    #[builder(default)]
    pub query: QueryConfig,
    /// Ingest validation.
    #[serde(default)]
    #[builder(default)]
    pub ingest: IngestConfig,
    /// Codec settings.
    #[serde(default)]
    #[builder(default)]
    pub codec: CodecConfig,
}

impl StorageConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.cache.validate()?;
        self.index.validate()?;
        self.retention.validate()?;
        self.query.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_validate() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn test_retry_builder_defaults_match_default_impl() {
        assert_eq!(RetryConfig::builder().build().unwrap(), RetryConfig::default());
    }

    #[test]
    fn test_retry_rejects_inverted_backoff() {
        let err = RetryConfig::builder()
            .initial_backoff(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRelation { field: "initial_backoff", .. }));
    }

    #[rstest]
    #[case::zero_default(0, 10)]
    #[case::zero_max(1, 0)]
    #[case::default_above_max(20, 10)]
    fn test_query_config_rejects(#[case] default_page_size: usize, #[case] max_page_size: usize) {
        let result =
            QueryConfig::builder().default_page_size(default_page_size).max_page_size(max_page_size).build();
        assert!(result.is_err());
    }

    #[rstest]
    #[case::default(None, 100)]
    #[case::requested(Some(10), 10)]
    #[case::clamped(Some(5_000), 1_000)]
    #[case::zero(Some(0), 1)]
    fn test_page_size_clamping(#[case] requested: Option<usize>, #[case] expected: usize) {
        assert_eq!(QueryConfig::default().page_size(requested), expected);
    }

    #[test]
    fn test_retention_cutoff_and_ttl() {
        let config = RetentionConfig::builder()
            .span_window(Duration::from_secs(60))
            .grace(Duration::from_secs(10))
            .build()
            .unwrap();
        let now = Timestamp::from_secs(1_000);
        assert_eq!(config.cutoff(RecordKind::Span, now), Timestamp::from_secs(940));
        assert_eq!(
            config.store_ttl(RecordKind::Span, Timestamp::from_secs(990), now),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.store_ttl(RecordKind::Span, Timestamp::from_secs(100), now),
            Duration::ZERO
        );
    }

    #[test]
    fn test_retention_rejects_zero_window() {
        let err = RetentionConfig::builder().log_window(Duration::ZERO).build().unwrap_err();
        assert!(err.to_string().contains("log_window"));
    }

    #[test]
    fn test_bucket_of() {
        let config = IndexConfig::builder().bucket_width(Duration::from_secs(60)).build();
        assert_eq!(config.bucket_of(Timestamp::from_secs(59)), 0);
        assert_eq!(config.bucket_of(Timestamp::from_secs(60)), 1);
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{
            "retention": { "span_window": "15m", "max_records": 1000 },
            "query": { "query_timeout": "250ms" },
            "index": { "bucket_width": "1m" }
        }"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retention.span_window, Duration::from_secs(900));
        assert_eq!(config.retention.log_window, default_log_window());
        assert_eq!(config.retention.max_records, Some(1000));
        assert_eq!(config.query.query_timeout, Duration::from_millis(250));
        assert_eq!(config.index.bucket_width, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let json = r#"{ "query": { "page": 5 } }"#;
        assert!(serde_json::from_str::<StorageConfig>(json).is_err());
    }
}
