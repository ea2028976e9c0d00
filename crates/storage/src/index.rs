//! Secondary indexes over stored records.
//!
//! Each index member is its own backing-store key, so concurrent appends are
//! set unions and never overwrite each other:
//!
//! | Dimension | Member key |
//! |-----------|------------|
//! | trace | `idx:trace:{traceId}:{ts}:{recordKey}` |
//! | service | `idx:service:{kind}:{name}:{bucket}:{ts}:{recordKey}` |
//! | metric | `idx:metric:{name}:{bucket}:{ts}:{recordKey}` |
//! | time | `idx:time:{kind}:{bucket}:{ts}:{recordKey}` |
//!
//! Every member's value is the encoded size of the record, which is what
//! capacity eviction sums. Bounded lookups on bucketed dimensions visit only
//! the buckets overlapping the range. Everything else is a prefix scan.
//!
//! The manager also owns the service and metric catalogs and the
//! `pending:index:*` reconciliation markers.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};

use bytes::Bytes;
use fail::fail_point;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    backend::{KeyValue, StoreBackend},
    client::StoreClient,
    config::IndexConfig,
    error::{StorageError, StorageResult},
    keys::{self, INDEX_PREFIX, METRIC_CATALOG_PREFIX, PENDING_PREFIX, SERVICE_CATALOG_PREFIX},
    model::{MetricMetadata, RecordKind, TelemetryRecord, TimeRange, Timestamp},
};

// ───────────────────────────────────────────────────────────────────────────
// Dimensions
// ───────────────────────────────────────────────────────────────────────────

/// One index a record can participate in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    /// Spans of a trace, and logs correlated with it.
    Trace(String),
    /// Records of one kind produced by a service.
    Service {
        /// Record kind.
        kind: RecordKind,
        /// Producing service.
        name: String,
    },
    /// All records of one kind, by time.
    Time(RecordKind),
    /// Samples of one metric name.
    Metric(String),
}

impl Dimension {
    /// Key prefix shared by every member of the dimension.
    #[must_use]
    pub fn prefix(&self) -> String {
        match self {
            Self::Trace(trace_id) => format!("{INDEX_PREFIX}trace:{}:", keys::escape(trace_id)),
            Self::Service { kind, name } => {
                format!("{INDEX_PREFIX}service:{kind}:{}:", keys::escape(name))
            },
            Self::Time(kind) => format!("{INDEX_PREFIX}time:{kind}:"),
            Self::Metric(name) => format!("{INDEX_PREFIX}metric:{}:", keys::escape(name)),
        }
    }

    /// Returns `true` if members are grouped into time buckets.
    #[must_use]
    pub fn is_bucketed(&self) -> bool {
        !matches!(self, Self::Trace(_))
    }

    fn bucket_prefix(&self, bucket: u64) -> String {
        format!("{}{}:", self.prefix(), keys::format_bucket(bucket))
    }

    fn member_key(&self, config: &IndexConfig, ts: Timestamp, record_key: &str) -> String {
        let ts_component = keys::format_timestamp(ts);
        if self.is_bucketed() {
            format!("{}{ts_component}:{record_key}", self.bucket_prefix(config.bucket_of(ts)))
        } else {
            format!("{}{ts_component}:{record_key}", self.prefix())
        }
    }

    /// Parses a member key of this dimension into `(timestamp, record key)`.
    fn parse_member(&self, key: &str) -> Option<(Timestamp, String)> {
        let mut rest = key.strip_prefix(self.prefix().as_str())?;
        if self.is_bucketed() {
            let (_bucket, after) = rest.split_once(':')?;
            rest = after;
        }
        let (ts, record_key) = rest.split_once(':')?;
        Some((keys::parse_timestamp(ts)?, record_key.to_owned()))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace(trace_id) => write!(f, "trace({trace_id})"),
            Self::Service { kind, name } => write!(f, "service({kind}, {name})"),
            Self::Time(kind) => write!(f, "time({kind})"),
            Self::Metric(name) => write!(f, "metric({name})"),
        }
    }
}

/// Dimensions a record participates in.
#[must_use]
pub fn dimensions_for(record: &TelemetryRecord) -> Vec<Dimension> {
    let kind = record.kind();
    let service = Dimension::Service { kind, name: record.service_name().to_owned() };
    match record {
        TelemetryRecord::Span(span) => {
            vec![Dimension::Trace(span.trace_id.clone()), service, Dimension::Time(kind)]
        },
        TelemetryRecord::Log(log) => {
            let mut dims = vec![service, Dimension::Time(kind)];
            if let Some(trace_id) = log.trace() {
                dims.push(Dimension::Trace(trace_id.to_owned()));
            }
            dims
        },
        TelemetryRecord::Metric(sample) => {
            vec![Dimension::Metric(sample.name.clone()), service, Dimension::Time(kind)]
        },
    }
}

/// One index member resolved to its record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexHit {
    /// Record timestamp.
    pub timestamp: Timestamp,
    /// Backing-store key of the record.
    pub record_key: String,
    /// Encoded record size in bytes.
    pub size: u64,
}

/// An index update that did not reach every dimension.
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// Some members were written, others failed.
    #[error("index update for {record_key} failed on {} dimension(s): {last_error}", failed.len())]
    Partial {
        /// Key of the record being indexed.
        record_key: String,
        /// Dimensions whose member write failed.
        failed: Vec<Dimension>,
        /// Last store error seen.
        last_error: StorageError,
    },
}

// ───────────────────────────────────────────────────────────────────────────
// IndexManager
// ───────────────────────────────────────────────────────────────────────────

/// Maintains index members, catalogs and reconciliation markers.
pub struct IndexManager<B> {
    client: StoreClient<B>,
    config: IndexConfig,
    inconsistent: Mutex<BTreeSet<String>>,
}

impl<B: StoreBackend> IndexManager<B> {
    /// Creates a manager writing through `client`.
    #[must_use]
    pub fn new(client: StoreClient<B>, config: IndexConfig) -> Self {
        Self { client, config, inconsistent: Mutex::new(BTreeSet::new()) }
    }

    /// Index settings.
    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Writes one member per dimension of `record`.
    ///
    /// Writes are idempotent, so a retry after a partial failure is safe.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Partial`] naming every dimension that failed.
    pub async fn index_record(
        &self,
        record: &TelemetryRecord,
        size: u64,
        ttl: Option<Duration>,
    ) -> Result<(), IndexError> {
        self.index_dimensions(record, size, ttl, &dimensions_for(record)).await
    }

    /// Writes members for the given dimensions only.
    ///
    /// # Errors
    ///
    /// See [`index_record`](Self::index_record).
    pub async fn index_dimensions(
        &self,
        record: &TelemetryRecord,
        size: u64,
        ttl: Option<Duration>,
        dimensions: &[Dimension],
    ) -> Result<(), IndexError> {
        let record_key = record.record_key();
        let ts = record.timestamp();
        let value = Bytes::from(size.to_string());
        let mut failed = Vec::new();
        let mut last_error = None;
        for dimension in dimensions {
            let member = dimension.member_key(&self.config, ts, &record_key);
            if let Err(err) = self.write_member(&member, value.clone(), ttl).await {
                debug!(%dimension, error = %err, "index member write failed");
                failed.push(dimension.clone());
                last_error = Some(err);
            }
        }
        match last_error {
            None => Ok(()),
            Some(last_error) => Err(IndexError::Partial { record_key, failed, last_error }),
        }
    }

    async fn write_member(&self, member: &str, value: Bytes, ttl: Option<Duration>) -> StorageResult<()> {
        fail_point!("index-write-member", |_| {
            Err(StorageError::internal("injected index member write failure"))
        });
        self.client.put(member, value, ttl).await
    }

    /// Returns the members of `dimension` whose timestamp lies in `range`,
    /// sorted by `(timestamp, record key)` without duplicates.
    ///
    /// # Errors
    ///
    /// Returns the store error of the first failed scan page.
    #[tracing::instrument(skip(self), fields(dimension = %dimension))]
    pub async fn lookup(&self, dimension: &Dimension, range: TimeRange) -> StorageResult<Vec<IndexHit>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let prefixes = self.scan_prefixes(dimension, range);
        let mut hits = BTreeMap::new();
        for prefix in prefixes {
            for KeyValue { key, value } in self.client.scan_prefix(prefix).collect_all().await? {
                let Some((timestamp, record_key)) = dimension.parse_member(&key) else {
                    warn!(%key, "skipping malformed index member");
                    continue;
                };
                if !range.contains(timestamp) {
                    continue;
                }
                let size = parse_size(&value);
                hits.insert((timestamp, record_key), size);
            }
        }
        Ok(hits
            .into_iter()
            .map(|((timestamp, record_key), size)| IndexHit { timestamp, record_key, size })
            .collect())
    }

    fn scan_prefixes(&self, dimension: &Dimension, range: TimeRange) -> Vec<String> {
        if let (true, Some(start), Some(end)) = (dimension.is_bucketed(), range.start, range.end) {
            let first = self.config.bucket_of(start);
            let last = self.config.bucket_of(end);
            if last - first < self.config.max_buckets_per_lookup {
                return (first..=last).map(|bucket| dimension.bucket_prefix(bucket)).collect();
            }
        }
        vec![dimension.prefix()]
    }

    /// Deletes the members of `hit` in `dimensions`. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns the first store error. Members deleted before it stay deleted.
    pub async fn remove_from_index(&self, hit: &IndexHit, dimensions: &[Dimension]) -> StorageResult<usize> {
        let mut removed = 0;
        for dimension in dimensions {
            if self.remove_member(dimension, hit).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes a single member.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn remove_member(&self, dimension: &Dimension, hit: &IndexHit) -> StorageResult<bool> {
        self.client.delete(&dimension.member_key(&self.config, hit.timestamp, &hit.record_key)).await
    }

    /// Deletes the members `previous` wrote that `current` does not rewrite,
    /// after a record key was stored again with a different timestamp or
    /// different dimension values. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns the first store error. Members deleted before it stay deleted.
    pub async fn remove_superseded(
        &self,
        previous: &TelemetryRecord,
        current: &TelemetryRecord,
    ) -> StorageResult<usize> {
        let record_key = current.record_key();
        let kept: BTreeSet<String> = dimensions_for(current)
            .iter()
            .map(|dimension| dimension.member_key(&self.config, current.timestamp(), &record_key))
            .collect();
        let mut removed = 0;
        for dimension in dimensions_for(previous) {
            let member = dimension.member_key(&self.config, previous.timestamp(), &record_key);
            if kept.contains(&member) {
                continue;
            }
            if self.client.delete(&member).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(%record_key, removed, "removed superseded index members");
        }
        Ok(removed)
    }

    // ── Reconciliation markers ────────────────────────────────────────────

    /// Persists a reconciliation marker for a record whose index update
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns the store error. The in-memory pending set is updated
    /// regardless.
    pub async fn mark_inconsistent(&self, record_key: &str, reason: &str) -> StorageResult<()> {
        self.inconsistent.lock().insert(record_key.to_owned());
        self.client.put(&keys::pending_key(record_key), Bytes::from(reason.to_owned()), None).await
    }

    /// Record keys awaiting reconciliation, merged from the store markers and
    /// the local set.
    ///
    /// # Errors
    ///
    /// Returns the scan error.
    pub async fn pending(&self) -> StorageResult<Vec<String>> {
        let stored = self.client.scan_prefix(PENDING_PREFIX).collect_all().await?;
        let mut local = self.inconsistent.lock();
        for KeyValue { key, .. } in stored {
            if let Some(record_key) = key.strip_prefix(PENDING_PREFIX) {
                local.insert(record_key.to_owned());
            }
        }
        Ok(local.iter().cloned().collect())
    }

    /// Number of locally known pending records.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inconsistent.lock().len()
    }

    /// Removes a reconciliation marker.
    ///
    /// # Errors
    ///
    /// Returns the store error. The local set keeps the key in that case.
    pub async fn clear_inconsistent(&self, record_key: &str) -> StorageResult<()> {
        self.client.delete(&keys::pending_key(record_key)).await?;
        self.inconsistent.lock().remove(record_key);
        Ok(())
    }

    // ── Catalogs ──────────────────────────────────────────────────────────

    /// Records the producing service and, for metrics, the metric metadata.
    ///
    /// Catalog entries only move forward in time: an older record does not
    /// overwrite a newer entry.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn record_catalog(&self, record: &TelemetryRecord, ttl: Option<Duration>) -> StorageResult<()> {
        let ts = record.timestamp();
        let service_key = keys::service_catalog_key(record.service_name());
        let newer = match self.client.get(&service_key).await? {
            Some(existing) => parse_catalog_timestamp(&existing).is_none_or(|seen| seen < ts),
            None => true,
        };
        if newer {
            self.client.put(&service_key, Bytes::from(keys::format_timestamp(ts)), ttl).await?;
        }

        if let TelemetryRecord::Metric(sample) = record {
            let metadata = MetricMetadata {
                name: sample.name.clone(),
                kind: sample.kind,
                unit: sample.unit.clone(),
                last_service: sample.service_name.clone(),
                last_seen: ts,
            };
            let catalog_key = keys::metric_catalog_key(&sample.name);
            let newer = self
                .read_metric_metadata(&catalog_key)
                .await?
                .is_none_or(|existing| existing.last_seen < ts);
            if newer {
                let encoded = rmp_serde::to_vec_named(&metadata)
                    .map_err(|e| StorageError::serialization(e.to_string()))?;
                self.client.put(&catalog_key, Bytes::from(encoded), ttl).await?;
            }
        }
        Ok(())
    }

    /// Services with live records, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns the scan error.
    pub async fn list_services(&self) -> StorageResult<Vec<String>> {
        let entries = self.client.scan_prefix(SERVICE_CATALOG_PREFIX).collect_all().await?;
        let names: BTreeSet<String> = entries
            .iter()
            .filter_map(|kv| kv.key.strip_prefix(SERVICE_CATALOG_PREFIX))
            .filter_map(|escaped| keys::unescape(escaped).map(|name| name.into_owned()))
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Metadata of one metric name.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a serialization error for a corrupt entry.
    pub async fn metric_metadata(&self, name: &str) -> StorageResult<Option<MetricMetadata>> {
        self.read_metric_metadata(&keys::metric_catalog_key(name)).await
    }

    /// Metadata of every known metric, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns the scan error. Corrupt entries are skipped.
    pub async fn list_metrics(&self) -> StorageResult<Vec<MetricMetadata>> {
        let entries = self.client.scan_prefix(METRIC_CATALOG_PREFIX).collect_all().await?;
        let mut metrics: Vec<MetricMetadata> = entries
            .iter()
            .filter_map(|kv| match rmp_serde::from_slice::<MetricMetadata>(&kv.value) {
                Ok(metadata) => Some(metadata),
                Err(err) => {
                    warn!(key = %kv.key, error = %err, "skipping corrupt metric catalog entry");
                    None
                },
            })
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(metrics)
    }

    async fn read_metric_metadata(&self, catalog_key: &str) -> StorageResult<Option<MetricMetadata>> {
        let Some(bytes) = self.client.get(catalog_key).await? else {
            return Ok(None);
        };
        rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::serialization(e.to_string()))
    }
}

fn parse_size(value: &[u8]) -> u64 {
    std::str::from_utf8(value).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn parse_catalog_timestamp(value: &[u8]) -> Option<Timestamp> {
    std::str::from_utf8(value).ok().and_then(keys::parse_timestamp)
}
