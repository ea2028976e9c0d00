//! The storage facade.
//!
//! [`TelemetryStore`] is the single entry point the ingestion and query
//! services use. It ties the codec, store client, index manager, retention
//! manager and read-through cache together:
//!
//! ```text
//! ingest ──► validate ──► encode ──► put body ──► index ──► catalogs ──► invalidate cache
//!                                                   │
//!                                                   └─ on failure: pending marker, IndexInconsistent
//!
//! query ──► budget ──► cache ──► index lookup ──► get + decode ──► filter ──► page
//! ```
//!
//! Query results are newest first, ordered by `(timestamp desc, key desc)`.
//! Page tokens are opaque; they encode the position of the last returned
//! item, so a page never repeats or skips records that existed when the
//! first page was read.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::StoreBackend,
    cache::{Cacheable, Fingerprint, InvalidationPlan, QueryCache, namespace},
    client::StoreClient,
    codec::Codec,
    config::{RetentionConfig, StorageConfig},
    error::{ConfigError, StorageError, TelemetryError, TelemetryResult},
    health::{HealthProbe, HealthStatus},
    index::{Dimension, IndexError, IndexHit, IndexManager},
    keys,
    metrics::{Metrics, MetricsSnapshot},
    model::{
        LogEntry, MetricMetadata, MetricSample, RecordKind, ServiceMap, Severity, Span, SpanStatus,
        TelemetryRecord, TimeRange, Timestamp, Trace, TraceSummary,
    },
    retention::{CapacityUsage, EvictionReport, RetentionManager, SweepReport},
    size_limits::validate_sizes,
};

// ───────────────────────────────────────────────────────────────────────────
// Queries and results
// ───────────────────────────────────────────────────────────────────────────

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Results, newest first.
    pub items: Vec<T>,
    /// Token for the next page, absent on the last page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// Returns `true` if no further page exists.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Log search filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct LogQuery {
    /// Producing service.
    #[builder(into)]
    pub service: Option<String>,
    /// Correlated trace.
    #[builder(into)]
    pub trace_id: Option<String>,
    /// Lowest severity to include.
    pub min_severity: Option<Severity>,
    /// Time window.
    #[builder(default)]
    pub range: TimeRange,
    /// Case-insensitive text over body and attribute values.
    #[builder(into)]
    pub text: Option<String>,
    /// Page size, clamped to the configured maximum.
    pub limit: Option<usize>,
    /// Token from the previous page.
    #[builder(into)]
    pub page_token: Option<String>,
}

impl LogQuery {
    fn matches(&self, log: &LogEntry, needle: Option<&str>) -> bool {
        self.service.as_ref().is_none_or(|s| *s == log.service_name)
            && self.trace_id.as_deref().is_none_or(|t| log.trace() == Some(t))
            && self.min_severity.is_none_or(|min| log.severity >= min)
            && needle.is_none_or(|n| log.matches_text(n))
    }
}

/// Metric search filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct MetricQuery {
    /// Metric name.
    #[builder(into)]
    pub name: Option<String>,
    /// Producing service.
    #[builder(into)]
    pub service: Option<String>,
    /// Time window.
    #[builder(default)]
    pub range: TimeRange,
    /// Labels that must all be present with these values.
    #[builder(default)]
    pub labels: BTreeMap<String, String>,
    /// Case-insensitive text over the name and label values.
    #[builder(into)]
    pub text: Option<String>,
    /// Page size, clamped to the configured maximum.
    pub limit: Option<usize>,
    /// Token from the previous page.
    #[builder(into)]
    pub page_token: Option<String>,
}

impl MetricQuery {
    fn matches(&self, sample: &MetricSample, needle: Option<&str>) -> bool {
        self.name.as_ref().is_none_or(|n| *n == sample.name)
            && self.service.as_ref().is_none_or(|s| *s == sample.service_name)
            && self.labels.iter().all(|(k, v)| sample.labels.get(k) == Some(v))
            && needle.is_none_or(|n| sample.matches_text(n))
    }
}

/// Span search filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct SpanQuery {
    /// Producing service.
    #[builder(into)]
    pub service: Option<String>,
    /// Span status.
    pub status: Option<SpanStatus>,
    /// Time window over span start.
    #[builder(default)]
    pub range: TimeRange,
    /// Case-insensitive text over operation name and attribute values.
    #[builder(into)]
    pub text: Option<String>,
    /// Page size, clamped to the configured maximum.
    pub limit: Option<usize>,
    /// Token from the previous page.
    #[builder(into)]
    pub page_token: Option<String>,
}

impl SpanQuery {
    fn matches(&self, span: &Span, needle: Option<&str>) -> bool {
        self.service.as_ref().is_none_or(|s| *s == span.service_name)
            && self.status.is_none_or(|status| span.status == status)
            && needle.is_none_or(|n| span.matches_text(n))
    }
}

/// Trace list filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct TraceQuery {
    /// Only traces with a span from this service.
    #[builder(into)]
    pub service: Option<String>,
    /// Only traces with at least one error span.
    #[builder(default)]
    pub errors_only: bool,
    /// Time window over span start.
    #[builder(default)]
    pub range: TimeRange,
    /// Page size, clamped to the configured maximum.
    pub limit: Option<usize>,
    /// Token from the previous page.
    #[builder(into)]
    pub page_token: Option<String>,
}

/// One record of a batch that was not cleanly ingested.
#[derive(Debug, Clone)]
pub struct IngestFailure {
    /// Position in the batch.
    pub index: usize,
    /// Record identifier.
    pub id: String,
    /// What went wrong.
    pub error: TelemetryError,
}

/// Outcome of [`TelemetryStore::ingest_batch`].
///
/// Records that were persisted but left index-inconsistent count as
/// accepted and are also listed in `errors`.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Records persisted.
    pub accepted: usize,
    /// Records rejected before or during the write.
    pub rejected: usize,
    /// Per-record failures.
    pub errors: Vec<IngestFailure>,
}

/// Outcome of [`TelemetryStore::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose index was repaired.
    pub repaired: u64,
    /// Markers whose record no longer exists.
    pub missing: u64,
    /// Records still inconsistent after this pass.
    pub failed: u64,
}

/// Point-in-time store statistics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Operation counters.
    pub metrics: MetricsSnapshot,
    /// Live cache entries.
    pub cache_entries: u64,
    /// Records awaiting index reconciliation.
    pub pending_reconciliation: usize,
    /// Stored volume.
    pub usage: CapacityUsage,
}

// ───────────────────────────────────────────────────────────────────────────
// Page tokens
// ───────────────────────────────────────────────────────────────────────────

fn encode_token(ts: Timestamp, key: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}:{key}", keys::format_timestamp(ts)))
}

fn decode_token(token: &str) -> TelemetryResult<(Timestamp, String)> {
    let malformed = || TelemetryError::invalid_query("malformed page token");
    let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| malformed())?;
    let raw = String::from_utf8(raw).map_err(|_| malformed())?;
    let (ts, key) = raw.split_once(':').ok_or_else(malformed)?;
    let ts = keys::parse_timestamp(ts).ok_or_else(malformed)?;
    if key.is_empty() {
        return Err(malformed());
    }
    Ok((ts, key.to_owned()))
}

/// Returns `true` if `position` comes strictly after the token position in
/// newest-first order.
fn after_token(after: Option<&(Timestamp, String)>, ts: Timestamp, key: &str) -> bool {
    after.is_none_or(|(token_ts, token_key)| (ts, key) < (*token_ts, token_key.as_str()))
}

fn needle(text: Option<&String>) -> Option<String> {
    text.map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty())
}

// ───────────────────────────────────────────────────────────────────────────
// Cache payloads
// ───────────────────────────────────────────────────────────────────────────

/// Size and backing expiry of a computed result.
#[derive(Debug, Clone, Copy, Default)]
struct CacheMeta {
    size: usize,
    expires_at: Option<Timestamp>,
}

impl CacheMeta {
    fn observe(&mut self, retention: &RetentionConfig, kind: RecordKind, ts: Timestamp, size: u64) {
        self.size += usize::try_from(size).unwrap_or(usize::MAX);
        let expiry = retention.expires_at(kind, ts);
        self.expires_at = Some(self.expires_at.map_or(expiry, |e| e.min(expiry)));
    }

    fn merge(&mut self, other: Self) {
        self.size += other.size;
        self.expires_at = match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

trait CachePayload: Clone + Send + Sync + 'static {
    fn wrap(value: Arc<Self>) -> CachedPayload;
    fn unwrap(payload: &CachedPayload) -> Option<Arc<Self>>;
}

macro_rules! cache_payloads {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        #[derive(Clone)]
        enum CachedPayload {
            $($variant(Arc<$ty>)),*
        }

        $(
            impl CachePayload for $ty {
                fn wrap(value: Arc<Self>) -> CachedPayload {
                    CachedPayload::$variant(value)
                }

                fn unwrap(payload: &CachedPayload) -> Option<Arc<Self>> {
                    match payload {
                        CachedPayload::$variant(value) => Some(Arc::clone(value)),
                        _ => None,
                    }
                }
            }
        )*
    };
}

cache_payloads! {
    Trace => Option<Trace>,
    Logs => Page<LogEntry>,
    Metrics => Page<MetricSample>,
    Spans => Page<Span>,
    Traces => Page<TraceSummary>,
    ServiceMap => ServiceMap,
    Services => Vec<String>,
    MetricCatalog => Vec<MetricMetadata>,
}

#[derive(Clone)]
struct CachedValue {
    payload: CachedPayload,
    meta: CacheMeta,
}

impl Cacheable for CachedValue {
    fn size_estimate(&self) -> usize {
        self.meta.size
    }

    fn expires_at(&self) -> Option<Timestamp> {
        self.meta.expires_at
    }
}

// ───────────────────────────────────────────────────────────────────────────
// TelemetryStore
// ───────────────────────────────────────────────────────────────────────────

struct StoreInner<B> {
    client: StoreClient<B>,
    index: Arc<IndexManager<B>>,
    retention: RetentionManager<B>,
    cache: QueryCache<CachedValue>,
    codec: Codec,
    config: StorageConfig,
    metrics: Metrics,
}

/// Storage facade over a [`StoreBackend`].
///
/// Clones share all state. Must be used inside a Tokio runtime.
///
/// ```
/// use std::time::Duration;
/// use tinyolly_common_storage::{
///     LogQuery, MemoryBackend, StorageConfig, TelemetryStore, Timestamp,
///     model::{LogEntry, Severity},
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = TelemetryStore::new(MemoryBackend::new(), StorageConfig::default())?;
///     let log = LogEntry {
///         id: "l-1".into(),
///         service_name: "checkout".into(),
///         timestamp: Timestamp::now().saturating_sub(Duration::from_secs(1)),
///         trace_id: None,
///         span_id: None,
///         severity: Severity::Warn,
///         body: "payment retry".into(),
///         attributes: Default::default(),
///     };
///     store.ingest(log.into()).await?;
///
///     let page = store.query_logs(LogQuery::builder().service("checkout").build()).await?;
///     assert_eq!(page.items.len(), 1);
///     Ok(())
/// }
/// ```
pub struct TelemetryStore<B> {
    inner: Arc<StoreInner<B>>,
}

impl<B> Clone for TelemetryStore<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: StoreBackend> TelemetryStore<B> {
    /// Creates a store with fresh metrics.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(backend: B, config: StorageConfig) -> Result<Self, ConfigError> {
        Self::with_metrics(backend, config, Metrics::new())
    }

    /// Creates a store recording into `metrics`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn with_metrics(backend: B, config: StorageConfig, metrics: Metrics) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = StoreClient::new(backend, config.client.clone(), metrics.clone());
        let codec = Codec::new(config.codec.clone());
        let index = Arc::new(IndexManager::new(client.clone(), config.index.clone()));
        let retention = RetentionManager::new(
            client.clone(),
            Arc::clone(&index),
            codec.clone(),
            config.retention.clone(),
            metrics.clone(),
        );
        let cache = QueryCache::new(config.cache.clone(), metrics.clone());
        Ok(Self {
            inner: Arc::new(StoreInner { client, index, retention, cache, codec, config, metrics }),
        })
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Shared metrics.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// The underlying store client.
    #[must_use]
    pub fn client(&self) -> &StoreClient<B> {
        &self.inner.client
    }

    // ── Ingest ────────────────────────────────────────────────────────────

    /// Validates, persists and indexes one record. Returns its store key.
    ///
    /// # Errors
    ///
    /// - [`TelemetryError::InvalidRecord`]: rejected before any write
    /// - [`TelemetryError::StoreUnavailable`]: the body write exhausted its retries
    /// - [`TelemetryError::IndexInconsistent`]: persisted, but indexed queries
    ///   may miss it until [`reconcile`](Self::reconcile) runs
    #[tracing::instrument(skip(self, record), fields(kind = %record.kind(), record_key = tracing::field::Empty))]
    pub async fn ingest(&self, record: TelemetryRecord) -> TelemetryResult<String> {
        let mut plan = InvalidationPlan::default();
        let result = self.ingest_one(&record, &mut plan).await;
        self.count_ingest(&result);
        plan.apply(&self.inner.cache).await;
        result
    }

    /// Ingests records in order and reports per-record outcomes.
    ///
    /// Once the store is unavailable, the remaining records are rejected
    /// with the same error without further attempts.
    #[tracing::instrument(skip_all)]
    pub async fn ingest_batch(&self, records: Vec<TelemetryRecord>) -> IngestReport {
        let mut report = IngestReport::default();
        let mut plan = InvalidationPlan::default();
        let mut outage: Option<TelemetryError> = None;

        for (index, record) in records.into_iter().enumerate() {
            let result = match &outage {
                Some(err) => Err(err.clone()),
                None => self.ingest_one(&record, &mut plan).await,
            };
            self.count_ingest(&result);
            match result {
                Ok(_) => report.accepted += 1,
                Err(error) => {
                    match &error {
                        TelemetryError::IndexInconsistent { .. } => report.accepted += 1,
                        TelemetryError::StoreUnavailable { .. } => {
                            report.rejected += 1;
                            outage.get_or_insert_with(|| error.clone());
                        },
                        _ => report.rejected += 1,
                    }
                    report.errors.push(IngestFailure { index, id: record.id(), error });
                },
            }
        }

        plan.apply(&self.inner.cache).await;
        debug!(accepted = report.accepted, rejected = report.rejected, "batch ingested");
        report
    }

    fn count_ingest(&self, result: &TelemetryResult<String>) {
        match result {
            Ok(_) | Err(TelemetryError::IndexInconsistent { .. }) => {
                self.inner.metrics.record_ingest_accepted();
            },
            Err(_) => self.inner.metrics.record_ingest_rejected(),
        }
    }

    async fn ingest_one(&self, record: &TelemetryRecord, plan: &mut InvalidationPlan) -> TelemetryResult<String> {
        let inner = &self.inner;
        let now = Timestamp::now();
        self.validate(record, now)?;

        let key = record.record_key();
        tracing::Span::current().record("record_key", key.as_str());
        let kind = record.kind();
        let bytes = inner.codec.encode(record)?;
        validate_sizes(&key, &bytes, &inner.config.ingest.size_limits)
            .map_err(|err| TelemetryError::invalid_record(err.to_string()))?;

        let ttl = inner.config.retention.store_ttl(kind, record.timestamp(), now);
        if ttl.is_zero() {
            return Err(TelemetryError::invalid_record(format!(
                "timestamp {} is past the {kind} retention window",
                record.timestamp()
            )));
        }

        let previous = self.previous_version(&key, kind).await?;
        let size = bytes.len() as u64;
        inner.client.put(&key, bytes, Some(ttl)).await?;
        let indexed = self.index_with_retries(record, size, ttl).await;

        if let Some(previous) = &previous {
            if let Err(err) = inner.index.remove_superseded(previous, record).await {
                warn!(record_key = %key, error = %err, "superseded index members not removed");
            }
            plan.add(kind, previous.trace_id());
        }
        if let Err(err) = inner.index.record_catalog(record, Some(ttl)).await {
            warn!(record_key = %key, error = %err, "catalog update failed");
        }
        plan.add(kind, record.trace_id());

        match indexed {
            Ok(()) => Ok(key),
            Err(IndexError::Partial { failed, last_error, .. }) => {
                let reason = format!("{} dimension(s) failed: {last_error}", failed.len());
                inner.metrics.record_index_inconsistent();
                error!(record_key = %key, %reason, "record persisted but index update failed, queued for reconciliation");
                if let Err(err) = inner.index.mark_inconsistent(&key, &reason).await {
                    warn!(record_key = %key, error = %err, "reconciliation marker not persisted");
                }
                Err(TelemetryError::IndexInconsistent { record_key: key, reason })
            },
        }
    }

    /// The body currently stored under `key`. An undecodable body is treated
    /// as absent.
    async fn previous_version(&self, key: &str, kind: RecordKind) -> TelemetryResult<Option<TelemetryRecord>> {
        let Some(bytes) = self.inner.client.get(key).await? else {
            return Ok(None);
        };
        match self.inner.codec.decode(&bytes, kind) {
            Ok(previous) => Ok(Some(previous)),
            Err(err) => {
                warn!(record_key = %key, error = %err, "overwriting undecodable record");
                Ok(None)
            },
        }
    }

    fn validate(&self, record: &TelemetryRecord, now: Timestamp) -> TelemetryResult<()> {
        if let Some(field) = record.missing_field() {
            return Err(TelemetryError::invalid_record(format!("missing required field `{field}`")));
        }
        if let TelemetryRecord::Metric(sample) = record
            && !sample.value.is_finite()
        {
            return Err(TelemetryError::invalid_record(format!(
                "metric value must be finite, got {}",
                sample.value
            )));
        }
        let ingest = &self.inner.config.ingest;
        let ts = record.timestamp();
        if ts < ingest.min_timestamp {
            return Err(TelemetryError::invalid_record(format!(
                "timestamp {ts} is before {}",
                ingest.min_timestamp
            )));
        }
        let latest = now.saturating_add(ingest.max_clock_skew);
        if ts > latest {
            return Err(TelemetryError::invalid_record(format!(
                "timestamp {ts} is more than {}s in the future",
                ingest.max_clock_skew.as_secs()
            )));
        }
        Ok(())
    }

    async fn index_with_retries(&self, record: &TelemetryRecord, size: u64, ttl: Duration) -> Result<(), IndexError> {
        let index = &self.inner.index;
        let mut result = index.index_record(record, size, Some(ttl)).await;
        for attempt in 1..=self.inner.config.index.index_retries {
            let Err(IndexError::Partial { failed, .. }) = &result else { break };
            debug!(attempt, failed = failed.len(), "retrying failed index dimensions");
            let failed = failed.clone();
            result = index.index_dimensions(record, size, Some(ttl), &failed).await;
        }
        result
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Fetches one record by store key. `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidQuery`] for a key outside the record
    /// namespaces, or a store or codec error.
    pub async fn get_record(&self, record_key: &str) -> TelemetryResult<Option<TelemetryRecord>> {
        let kind = keys::kind_of(record_key)
            .ok_or_else(|| TelemetryError::invalid_query(format!("not a record key: {record_key}")))?;
        match self.inner.client.get(record_key).await? {
            Some(bytes) => Ok(Some(self.inner.codec.decode(&bytes, kind)?)),
            None => Ok(None),
        }
    }

    /// Assembles a trace. `None` if no span of it is stored.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidQuery`] for an empty id,
    /// [`TelemetryError::Timeout`] past the query budget, or a store error.
    #[tracing::instrument(skip(self))]
    pub async fn get_trace(&self, trace_id: &str) -> TelemetryResult<Option<Trace>> {
        if trace_id.trim().is_empty() {
            return Err(TelemetryError::invalid_query("trace id must not be empty"));
        }
        self.budgeted("get_trace", async {
            let trace = self.cached(Fingerprint::trace(trace_id), || self.load_trace(trace_id)).await?;
            Ok(Arc::unwrap_or_clone(trace))
        })
        .await
    }

    /// Searches logs.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidQuery`] for a bad page token,
    /// [`TelemetryError::Timeout`] past the query budget, or a store error.
    #[tracing::instrument(skip(self))]
    pub async fn query_logs(&self, query: LogQuery) -> TelemetryResult<Page<LogEntry>> {
        self.budgeted("query_logs", async {
            let fingerprint = Fingerprint::from_query(namespace::LOGS, &query);
            let page = self.cached(fingerprint, || self.compute_logs(&query)).await?;
            Ok(Arc::unwrap_or_clone(page))
        })
        .await
    }

    /// Searches metric samples.
    ///
    /// # Errors
    ///
    /// See [`query_logs`](Self::query_logs).
    #[tracing::instrument(skip(self))]
    pub async fn query_metrics(&self, query: MetricQuery) -> TelemetryResult<Page<MetricSample>> {
        self.budgeted("query_metrics", async {
            let fingerprint = Fingerprint::from_query(namespace::METRICS, &query);
            let page = self.cached(fingerprint, || self.compute_metrics(&query)).await?;
            Ok(Arc::unwrap_or_clone(page))
        })
        .await
    }

    /// Searches spans.
    ///
    /// # Errors
    ///
    /// See [`query_logs`](Self::query_logs).
    #[tracing::instrument(skip(self))]
    pub async fn query_spans(&self, query: SpanQuery) -> TelemetryResult<Page<Span>> {
        self.budgeted("query_spans", async {
            let fingerprint = Fingerprint::from_query(namespace::SPANS, &query);
            let page = self.cached(fingerprint, || self.compute_spans(&query)).await?;
            Ok(Arc::unwrap_or_clone(page))
        })
        .await
    }

    /// Lists trace summaries, newest trace first.
    ///
    /// # Errors
    ///
    /// See [`query_logs`](Self::query_logs).
    #[tracing::instrument(skip(self))]
    pub async fn list_traces(&self, query: TraceQuery) -> TelemetryResult<Page<TraceSummary>> {
        self.budgeted("list_traces", async {
            let fingerprint = Fingerprint::from_query(namespace::TRACES, &query);
            let page = self.cached(fingerprint, || self.compute_traces(&query)).await?;
            Ok(Arc::unwrap_or_clone(page))
        })
        .await
    }

    /// Derives the service dependency map from spans started in `range`.
    ///
    /// An edge is a parent span in one service with a child span in another.
    /// Edges below `min_call_count` calls are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Timeout`] past the query budget, or a store
    /// error.
    #[tracing::instrument(skip(self))]
    pub async fn get_service_map(&self, range: TimeRange) -> TelemetryResult<ServiceMap> {
        self.budgeted("get_service_map", async {
            let fingerprint = Fingerprint::from_query(namespace::SERVICE_MAP, &range);
            let map = self.cached(fingerprint, || self.compute_service_map(range)).await?;
            Ok(Arc::unwrap_or_clone(map))
        })
        .await
    }

    /// Services with live records, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Timeout`] past the query budget, or a store
    /// error.
    pub async fn list_services(&self) -> TelemetryResult<Vec<String>> {
        self.budgeted("list_services", async {
            let services = self
                .cached(Fingerprint::new(namespace::SERVICES, "all"), || async {
                    let services = self.inner.index.list_services().await?;
                    let size = services.iter().map(String::len).sum();
                    Ok((services, CacheMeta { size, expires_at: None }))
                })
                .await?;
            Ok(Arc::unwrap_or_clone(services))
        })
        .await
    }

    /// Catalog entry for a metric name.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Timeout`] past the query budget, or a store
    /// error.
    pub async fn metric_metadata(&self, name: &str) -> TelemetryResult<Option<MetricMetadata>> {
        self.budgeted("metric_metadata", async { Ok(self.inner.index.metric_metadata(name).await?) })
            .await
    }

    /// Catalog entries for every known metric, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Timeout`] past the query budget, or a store
    /// error.
    pub async fn list_metrics(&self) -> TelemetryResult<Vec<MetricMetadata>> {
        self.budgeted("list_metrics", async {
            let metrics = self
                .cached(Fingerprint::new(namespace::METRIC_CATALOG, "all"), || async {
                    let metrics = self.inner.index.list_metrics().await?;
                    let size = metrics.iter().map(|m| m.name.len() + m.last_service.len() + 32).sum();
                    Ok((metrics, CacheMeta { size, expires_at: None }))
                })
                .await?;
            Ok(Arc::unwrap_or_clone(metrics))
        })
        .await
    }

    // ── Query internals ───────────────────────────────────────────────────

    async fn budgeted<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = TelemetryResult<T>>,
    ) -> TelemetryResult<T> {
        let budget = self.inner.config.query.query_timeout;
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                self.inner.metrics.record_query_timeout();
                warn!(operation, budget_ms = budget.as_millis() as u64, "query exceeded its time budget");
                Err(TelemetryError::Timeout { operation, budget })
            },
        }
    }

    async fn cached<T, F, Fut>(&self, fingerprint: Fingerprint, mut compute: F) -> TelemetryResult<Arc<T>>
    where
        T: CachePayload,
        F: FnMut() -> Fut,
        Fut: Future<Output = TelemetryResult<(T, CacheMeta)>>,
    {
        let value = self
            .inner
            .cache
            .get_or_compute(fingerprint, || {
                let computed = compute();
                async move {
                    let (value, meta) = computed.await?;
                    Ok::<_, TelemetryError>(CachedValue { payload: T::wrap(Arc::new(value)), meta })
                }
            })
            .await?;
        T::unwrap(&value.payload)
            .ok_or_else(|| StorageError::internal("cached value has an unexpected type").into())
    }

    /// Fetches and decodes the record behind an index hit. A missing body, or
    /// one stored again at another timestamp, is read-repaired by dropping the
    /// member; an undecodable body is skipped.
    async fn load_hit(
        &self,
        dimension: &Dimension,
        hit: &IndexHit,
        kind: RecordKind,
    ) -> TelemetryResult<Option<TelemetryRecord>> {
        let Some(bytes) = self.inner.client.get(&hit.record_key).await? else {
            debug!(record_key = %hit.record_key, %dimension, "dropping index member of a missing record");
            if let Err(err) = self.inner.index.remove_member(dimension, hit).await {
                debug!(error = %err, "read repair failed");
            }
            return Ok(None);
        };
        match self.inner.codec.decode(&bytes, kind) {
            Ok(record) if record.timestamp() != hit.timestamp => {
                debug!(record_key = %hit.record_key, %dimension, "dropping index member of a superseded record");
                if let Err(err) = self.inner.index.remove_member(dimension, hit).await {
                    debug!(error = %err, "read repair failed");
                }
                Ok(None)
            },
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(record_key = %hit.record_key, error = %err, "skipping undecodable record");
                Ok(None)
            },
        }
    }

    /// Walks `dimension` newest first and pages the records `extract` keeps.
    async fn page_records<T>(
        &self,
        kind: RecordKind,
        dimension: Dimension,
        range: TimeRange,
        limit: Option<usize>,
        page_token: Option<&str>,
        mut extract: impl FnMut(TelemetryRecord) -> Option<T>,
    ) -> TelemetryResult<(Page<T>, CacheMeta)> {
        let limit = self.inner.config.query.page_size(limit);
        let after = page_token.map(decode_token).transpose()?;
        let mut hits = self.inner.index.lookup(&dimension, range).await?;
        hits.retain(|hit| keys::kind_of(&hit.record_key) == Some(kind));

        let mut items = Vec::with_capacity(limit.min(hits.len()));
        let mut meta = CacheMeta::default();
        let mut last = None;
        let mut more = false;
        for hit in hits.iter().rev() {
            if !after_token(after.as_ref(), hit.timestamp, &hit.record_key) {
                continue;
            }
            let Some(record) = self.load_hit(&dimension, hit, kind).await? else { continue };
            let Some(item) = extract(record) else { continue };
            if items.len() == limit {
                more = true;
                break;
            }
            meta.observe(&self.inner.config.retention, kind, hit.timestamp, hit.size);
            last = Some((hit.timestamp, hit.record_key.as_str()));
            items.push(item);
        }

        let next_token = if more { last.map(|(ts, key)| encode_token(ts, key)) } else { None };
        Ok((Page { items, next_token }, meta))
    }

    async fn compute_logs(&self, query: &LogQuery) -> TelemetryResult<(Page<LogEntry>, CacheMeta)> {
        let dimension = match (&query.trace_id, &query.service) {
            (Some(trace_id), _) => Dimension::Trace(trace_id.clone()),
            (None, Some(service)) => Dimension::Service { kind: RecordKind::Log, name: service.clone() },
            (None, None) => Dimension::Time(RecordKind::Log),
        };
        let needle = needle(query.text.as_ref());
        self.page_records(
            RecordKind::Log,
            dimension,
            query.range,
            query.limit,
            query.page_token.as_deref(),
            |record| match record {
                TelemetryRecord::Log(log) if query.matches(&log, needle.as_deref()) => Some(log),
                _ => None,
            },
        )
        .await
    }

    async fn compute_metrics(&self, query: &MetricQuery) -> TelemetryResult<(Page<MetricSample>, CacheMeta)> {
        let dimension = match (&query.name, &query.service) {
            (Some(name), _) => Dimension::Metric(name.clone()),
            (None, Some(service)) => Dimension::Service { kind: RecordKind::Metric, name: service.clone() },
            (None, None) => Dimension::Time(RecordKind::Metric),
        };
        let needle = needle(query.text.as_ref());
        self.page_records(
            RecordKind::Metric,
            dimension,
            query.range,
            query.limit,
            query.page_token.as_deref(),
            |record| match record {
                TelemetryRecord::Metric(sample) if query.matches(&sample, needle.as_deref()) => Some(sample),
                _ => None,
            },
        )
        .await
    }

    async fn compute_spans(&self, query: &SpanQuery) -> TelemetryResult<(Page<Span>, CacheMeta)> {
        let dimension = match &query.service {
            Some(service) => Dimension::Service { kind: RecordKind::Span, name: service.clone() },
            None => Dimension::Time(RecordKind::Span),
        };
        let needle = needle(query.text.as_ref());
        self.page_records(
            RecordKind::Span,
            dimension,
            query.range,
            query.limit,
            query.page_token.as_deref(),
            |record| match record {
                TelemetryRecord::Span(span) if query.matches(&span, needle.as_deref()) => Some(span),
                _ => None,
            },
        )
        .await
    }

    async fn load_trace(&self, trace_id: &str) -> TelemetryResult<(Option<Trace>, CacheMeta)> {
        let dimension = Dimension::Trace(trace_id.to_owned());
        let hits = self.inner.index.lookup(&dimension, TimeRange::all()).await?;
        let mut spans = Vec::new();
        let mut meta = CacheMeta::default();
        for hit in hits.iter().filter(|h| keys::kind_of(&h.record_key) == Some(RecordKind::Span)) {
            if let Some(TelemetryRecord::Span(span)) = self.load_hit(&dimension, hit, RecordKind::Span).await? {
                meta.observe(&self.inner.config.retention, RecordKind::Span, hit.timestamp, hit.size);
                spans.push(span);
            }
        }
        Ok((Trace::assemble(trace_id, spans), meta))
    }

    async fn compute_traces(&self, query: &TraceQuery) -> TelemetryResult<(Page<TraceSummary>, CacheMeta)> {
        let limit = self.inner.config.query.page_size(query.limit);
        let after = query.page_token.as_deref().map(decode_token).transpose()?;
        let dimension = match &query.service {
            Some(service) => Dimension::Service { kind: RecordKind::Span, name: service.clone() },
            None => Dimension::Time(RecordKind::Span),
        };

        // Position each trace by its earliest span inside the window.
        let mut first_seen: HashMap<String, Timestamp> = HashMap::new();
        for hit in self.inner.index.lookup(&dimension, query.range).await? {
            if let Some(trace_id) = keys::trace_id_of_span_key(&hit.record_key) {
                first_seen
                    .entry(trace_id)
                    .and_modify(|ts| *ts = (*ts).min(hit.timestamp))
                    .or_insert(hit.timestamp);
            }
        }
        let mut positions: Vec<(Timestamp, String)> =
            first_seen.into_iter().map(|(trace_id, ts)| (ts, trace_id)).collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));

        let mut items = Vec::new();
        let mut meta = CacheMeta::default();
        let mut last = None;
        let mut more = false;
        for (ts, trace_id) in &positions {
            if !after_token(after.as_ref(), *ts, trace_id) {
                continue;
            }
            let (trace, trace_meta) = self.load_trace(trace_id).await?;
            let Some(trace) = trace else { continue };
            if query.errors_only && trace.error_count == 0 {
                continue;
            }
            if items.len() == limit {
                more = true;
                break;
            }
            meta.merge(trace_meta);
            last = Some((*ts, trace_id.as_str()));
            items.push(trace.summary());
        }

        let next_token = if more { last.map(|(ts, id)| encode_token(ts, id)) } else { None };
        Ok((Page { items, next_token }, meta))
    }

    async fn compute_service_map(&self, range: TimeRange) -> TelemetryResult<(ServiceMap, CacheMeta)> {
        let dimension = Dimension::Time(RecordKind::Span);
        let mut spans: HashMap<(String, String), Span> = HashMap::new();
        let mut meta = CacheMeta::default();
        for hit in self.inner.index.lookup(&dimension, range).await? {
            if let Some(TelemetryRecord::Span(span)) = self.load_hit(&dimension, &hit, RecordKind::Span).await? {
                meta.observe(&self.inner.config.retention, RecordKind::Span, hit.timestamp, hit.size);
                spans.insert((span.trace_id.clone(), span.span_id.clone()), span);
            }
        }

        // Parents that started before the window are fetched directly.
        let mut outside: HashMap<(String, String), Option<String>> = HashMap::new();
        let mut calls: Vec<(String, String, bool)> = Vec::new();
        for span in spans.values() {
            let Some(parent_id) = span.parent() else { continue };
            let parent_key = (span.trace_id.clone(), parent_id.to_owned());
            let caller = match spans.get(&parent_key) {
                Some(parent) => Some(parent.service_name.clone()),
                None => match outside.get(&parent_key) {
                    Some(service) => service.clone(),
                    None => {
                        let service = self.parent_service(&span.trace_id, parent_id).await?;
                        outside.insert(parent_key, service.clone());
                        service
                    },
                },
            };
            if let Some(caller) = caller {
                calls.push((caller, span.service_name.clone(), span.is_error()));
            }
        }

        let services: BTreeSet<&str> = spans
            .values()
            .map(|s| s.service_name.as_str())
            .chain(calls.iter().map(|(caller, _, _)| caller.as_str()))
            .collect();
        let map = ServiceMap::aggregate(
            range,
            services,
            calls.iter().map(|(caller, callee, is_error)| (caller.as_str(), callee.as_str(), *is_error)),
            self.inner.config.query.min_call_count,
        );
        Ok((map, meta))
    }

    async fn parent_service(&self, trace_id: &str, span_id: &str) -> TelemetryResult<Option<String>> {
        let key = keys::span_key(trace_id, span_id);
        let Some(bytes) = self.inner.client.get(&key).await? else { return Ok(None) };
        Ok(match self.inner.codec.decode(&bytes, RecordKind::Span) {
            Ok(TelemetryRecord::Span(span)) => Some(span.service_name),
            _ => None,
        })
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Removes records past their retention window at `now`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the time index cannot be scanned.
    pub async fn sweep(&self, now: Timestamp) -> TelemetryResult<SweepReport> {
        Ok(self.inner.retention.sweep(now, &self.inner.cache).await?)
    }

    /// Evicts the oldest records until the capacity ceilings hold.
    ///
    /// # Errors
    ///
    /// Returns the store error if the time index cannot be scanned.
    pub async fn evict_to_capacity(&self) -> TelemetryResult<EvictionReport> {
        Ok(self.inner.retention.evict_to_capacity(&self.inner.cache).await?)
    }

    /// Re-indexes records with pending reconciliation markers.
    ///
    /// # Errors
    ///
    /// Returns the store error if the markers cannot be read or cleared.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> TelemetryResult<ReconcileReport> {
        let inner = &self.inner;
        let pending = inner.index.pending().await?;
        if pending.is_empty() {
            return Ok(ReconcileReport::default());
        }
        let now = Timestamp::now();
        let mut report = ReconcileReport::default();
        let mut plan = InvalidationPlan::default();

        for record_key in pending {
            let Some(kind) = keys::kind_of(&record_key) else {
                warn!(%record_key, "dropping reconciliation marker for an unknown key");
                inner.index.clear_inconsistent(&record_key).await?;
                report.missing += 1;
                continue;
            };
            let Some(bytes) = inner.client.get(&record_key).await? else {
                inner.index.clear_inconsistent(&record_key).await?;
                report.missing += 1;
                continue;
            };
            let record = match inner.codec.decode(&bytes, kind) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%record_key, error = %err, "cannot reconcile undecodable record");
                    report.failed += 1;
                    continue;
                },
            };
            let ttl = inner.config.retention.store_ttl(kind, record.timestamp(), now);
            match inner.index.index_record(&record, bytes.len() as u64, Some(ttl)).await {
                Ok(()) => {
                    inner.index.clear_inconsistent(&record_key).await?;
                    plan.add(kind, record.trace_id());
                    report.repaired += 1;
                },
                Err(err) => {
                    warn!(%record_key, error = %err, "reconciliation attempt failed");
                    report.failed += 1;
                },
            }
        }

        inner.metrics.record_reconciled(report.repaired);
        plan.apply(&inner.cache).await;
        info!(repaired = report.repaired, missing = report.missing, failed = report.failed, "reconciliation pass complete");
        Ok(report)
    }

    /// Starts the background sweep, eviction and reconciliation loop at the
    /// configured maintenance interval.
    #[must_use = "dropping the handle stops the maintenance task"]
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let store = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let period = self.inner.config.retention.maintenance_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                select! {
                    _ = ticker.tick() => store.run_maintenance().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("maintenance task stopped");
        });
        MaintenanceHandle { shutdown_tx, task }
    }

    async fn run_maintenance(&self) {
        if let Err(err) = self.sweep(Timestamp::now()).await {
            warn!(error = %err, "retention sweep failed");
        }
        if let Err(err) = self.evict_to_capacity().await {
            warn!(error = %err, "capacity eviction failed");
        }
        if let Err(err) = self.reconcile().await {
            warn!(error = %err, "reconciliation failed");
        }
        self.inner.metrics.log_metrics();
    }

    // ── Health ────────────────────────────────────────────────────────────

    /// Round-trips the backing store under the health timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::StoreUnavailable`] if the store does not
    /// answer.
    pub async fn ping(&self) -> TelemetryResult<Duration> {
        self.inner
            .client
            .ping()
            .await
            .map_err(|err| TelemetryError::StoreUnavailable { source: err })
    }

    /// Probes the store. Readiness is degraded while records await index
    /// reconciliation.
    pub async fn health_check(&self, probe: HealthProbe) -> HealthStatus {
        let mut status = self.inner.client.health_check(probe).await;
        let pending = self.inner.index.pending_count();
        status.metadata_mut().details.insert("pending_reconciliation".into(), pending.to_string());
        if probe == HealthProbe::Readiness && pending > 0 && status.is_healthy() {
            warn!(pending, "readiness degraded by pending index reconciliation");
            status = status.degrade(format!("{pending} record(s) awaiting index reconciliation"));
        }
        status
    }

    /// Collects counters, cache size, pending markers and stored volume.
    ///
    /// # Errors
    ///
    /// Returns the store error if the time index cannot be scanned.
    pub async fn stats(&self) -> TelemetryResult<StoreStats> {
        Ok(StoreStats {
            metrics: self.inner.metrics.snapshot(),
            cache_entries: self.inner.cache.entry_count().await,
            pending_reconciliation: self.inner.index.pending_count(),
            usage: self.inner.retention.capacity_usage().await?,
        })
    }
}

/// Handle to the background maintenance task. Dropping it stops the task.
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signals the task to stop and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.task.await {
            warn!(error = %err, "maintenance task ended abnormally");
        }
    }

    /// Returns `true` once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::{
        memory::MemoryBackend,
        testutil::{ago, fast_config, log_entry, metric_sample, span},
    };

    fn store() -> TelemetryStore<MemoryBackend> {
        TelemetryStore::new(MemoryBackend::new(), fast_config()).unwrap()
    }

    #[test]
    fn test_token_roundtrip() {
        let token = encode_token(Timestamp::from_nanos(42), "log:a:b");
        assert_eq!(decode_token(&token).unwrap(), (Timestamp::from_nanos(42), "log:a:b".to_owned()));
    }

    #[rstest]
    #[case::not_base64("!!!")]
    #[case::no_separator("MTIz")]
    #[case::short_timestamp("MTI6bG9nOmE")]
    #[case::empty("")]
    fn test_bad_tokens_rejected(#[case] token: &str) {
        assert!(matches!(decode_token(token), Err(TelemetryError::InvalidQuery { .. })));
    }

    #[test]
    fn test_after_token_is_strict() {
        let pos = (Timestamp::from_nanos(10), "log:b".to_owned());
        assert!(!after_token(Some(&pos), Timestamp::from_nanos(10), "log:b"));
        assert!(after_token(Some(&pos), Timestamp::from_nanos(10), "log:a"));
        assert!(!after_token(Some(&pos), Timestamp::from_nanos(11), "log:a"));
        assert!(after_token(None, Timestamp::from_nanos(11), "log:a"));
    }

    #[tokio::test]
    async fn test_validation_rejects() {
        let store = store();
        let mut missing = log_entry("l1", "", ago(Duration::from_secs(1)));
        missing.service_name = " ".into();
        assert!(matches!(
            store.ingest(missing.into()).await,
            Err(TelemetryError::InvalidRecord { ref reason }) if reason.contains("service_name")
        ));

        let nan = metric_sample("m1", "api", "cpu", f64::NAN, ago(Duration::from_secs(1)));
        assert!(matches!(store.ingest(nan.into()).await, Err(TelemetryError::InvalidRecord { .. })));

        let ancient = log_entry("l2", "api", 1);
        assert!(matches!(store.ingest(ancient.into()).await, Err(TelemetryError::InvalidRecord { .. })));

        let future = log_entry("l3", "api", Timestamp::now().saturating_add(Duration::from_secs(3600)).as_nanos());
        assert!(matches!(store.ingest(future.into()).await, Err(TelemetryError::InvalidRecord { .. })));

        let expired = log_entry("l4", "api", ago(Duration::from_secs(3 * 3600)));
        assert!(matches!(store.ingest(expired.into()).await, Err(TelemetryError::InvalidRecord { .. })));

        assert_eq!(store.metrics().snapshot().ingest_rejected, 5);
        assert!(store.client().backend().is_empty());
    }

    #[tokio::test]
    async fn test_get_record_and_trace() {
        let store = store();
        let t0 = ago(Duration::from_secs(60));
        store.ingest(span("t1", "root", None, "web", t0).into()).await.unwrap();
        store.ingest(span("t1", "db", Some("root"), "db", t0 + 10).into()).await.unwrap();

        let record = store.get_record("span:t1:root").await.unwrap().unwrap();
        assert_eq!(record.service_name(), "web");
        assert!(store.get_record("log:nope").await.unwrap().is_none());
        assert!(matches!(store.get_record("idx:x").await, Err(TelemetryError::InvalidQuery { .. })));

        let trace = store.get_trace("t1").await.unwrap().unwrap();
        assert_eq!(trace.span_count(), 2);
        assert_eq!(trace.root().span_id, "root");
        assert!(store.get_trace("missing").await.unwrap().is_none());
        assert!(matches!(store.get_trace("").await, Err(TelemetryError::InvalidQuery { .. })));
    }

    #[tokio::test]
    async fn test_ingest_invalidates_cached_trace() {
        let store = store();
        let t0 = ago(Duration::from_secs(60));
        store.ingest(span("t1", "root", None, "web", t0).into()).await.unwrap();
        assert_eq!(store.get_trace("t1").await.unwrap().unwrap().span_count(), 1);
        assert_eq!(store.get_trace("t1").await.unwrap().unwrap().span_count(), 1);
        assert_eq!(store.metrics().snapshot().cache_hits, 1);

        store.ingest(span("t1", "child", Some("root"), "api", t0 + 5).into()).await.unwrap();
        assert_eq!(store.get_trace("t1").await.unwrap().unwrap().span_count(), 2);
    }

    #[tokio::test]
    async fn test_catalog_queries() {
        let store = store();
        let ts = ago(Duration::from_secs(5));
        store.ingest(metric_sample("m1", "api", "http.requests", 1.0, ts).into()).await.unwrap();
        store.ingest(log_entry("l1", "worker", ts).into()).await.unwrap();

        assert_eq!(store.list_services().await.unwrap(), ["api", "worker"]);
        assert_eq!(store.list_metrics().await.unwrap().len(), 1);
        let meta = store.metric_metadata("http.requests").await.unwrap().unwrap();
        assert_eq!(meta.last_service, "api");
    }

    #[tokio::test]
    async fn test_readiness_degraded_while_pending() {
        let store = store();
        assert!(store.health_check(HealthProbe::Readiness).await.is_healthy());
        store.inner.index.mark_inconsistent("log:l1", "boom").await.unwrap();
        let status = store.health_check(HealthProbe::Readiness).await;
        assert!(status.is_degraded());
        assert!(store.health_check(HealthProbe::Liveness).await.is_healthy());

        let report = store.reconcile().await.unwrap();
        assert_eq!(report.missing, 1);
        assert!(store.health_check(HealthProbe::Readiness).await.is_healthy());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = store();
        store.ingest(log_entry("l1", "api", ago(Duration::from_secs(1))).into()).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.usage.records, 1);
        assert_eq!(stats.metrics.ingest_accepted, 1);
        assert_eq!(stats.pending_reconciliation, 0);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_maintenance_handle_stops() {
        let mut config = fast_config();
        config.retention.maintenance_interval = Duration::from_millis(10);
        let store = TelemetryStore::new(MemoryBackend::new(), config).unwrap();
        let handle = store.spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }
}
