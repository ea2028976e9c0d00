//! Retention sweeps and capacity eviction.
//!
//! The time index is the source of truth for what is stored: a sweep walks
//! `idx:time:{kind}` below each kind's cutoff, and eviction walks all time
//! members oldest first. Removing a record deletes the body and every index
//! member the body names. When the body is already gone (store TTL fired
//! first) only the time member is removed; lookups read-repair the rest.

use std::{sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use crate::{
    backend::StoreBackend,
    cache::{InvalidationPlan, InvalidationSink},
    client::StoreClient,
    codec::Codec,
    config::RetentionConfig,
    error::StorageResult,
    index::{Dimension, IndexHit, IndexManager, dimensions_for},
    keys,
    metrics::Metrics,
    model::{RecordKind, TimeRange, Timestamp},
};

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Spans removed.
    pub spans: u64,
    /// Log entries removed.
    pub logs: u64,
    /// Metric samples removed.
    pub metrics: u64,
    /// Index members removed, including time members.
    pub index_members: u64,
    /// Records that could not be removed this pass.
    pub failures: u64,
}

impl SweepReport {
    /// Records removed across all kinds.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.spans + self.logs + self.metrics
    }

    fn count(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Span => self.spans += 1,
            RecordKind::Log => self.logs += 1,
            RecordKind::Metric => self.metrics += 1,
        }
    }
}

/// Outcome of capacity eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Records evicted.
    pub evicted: u64,
    /// Encoded bytes freed.
    pub bytes_freed: u64,
    /// Records left afterwards.
    pub remaining_records: u64,
    /// Encoded bytes left afterwards.
    pub remaining_bytes: u64,
}

/// Stored volume as seen by the time index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityUsage {
    /// Stored records.
    pub records: u64,
    /// Summed encoded size.
    pub bytes: u64,
}

/// Applies retention windows and capacity ceilings.
pub struct RetentionManager<B> {
    client: StoreClient<B>,
    index: Arc<IndexManager<B>>,
    codec: Codec,
    config: RetentionConfig,
    metrics: Metrics,
}

impl<B: StoreBackend> RetentionManager<B> {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        client: StoreClient<B>,
        index: Arc<IndexManager<B>>,
        codec: Codec,
        config: RetentionConfig,
        metrics: Metrics,
    ) -> Self {
        Self { client, index, codec, config, metrics }
    }

    /// Retention settings.
    #[must_use]
    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Removes every record older than its kind's cutoff at `now`.
    ///
    /// A record exactly at the cutoff is retained. Running the sweep twice
    /// with the same `now` removes nothing the second time.
    ///
    /// # Errors
    ///
    /// Returns the store error if the time index cannot be scanned. Records
    /// removed before the failed scan are still invalidated in `sink`.
    /// Failures on individual records are counted in the report and retried
    /// on the next sweep.
    #[tracing::instrument(skip(self, sink), fields(%now))]
    pub async fn sweep(&self, now: Timestamp, sink: &dyn InvalidationSink) -> StorageResult<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let mut plan = InvalidationPlan::default();

        let swept = self.sweep_kinds(now, &mut report, &mut plan).await;
        // Records removed before a failed scan still need their cache entries dropped.
        plan.apply(sink).await;
        self.metrics.record_expired(report.total());
        if let Err(err) = swept {
            warn!(removed = report.total(), error = %err, "retention sweep aborted");
            return Err(err);
        }
        if report.total() > 0 || report.failures > 0 {
            info!(
                spans = report.spans,
                logs = report.logs,
                metrics = report.metrics,
                failures = report.failures,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "retention sweep complete"
            );
        }
        Ok(report)
    }

    async fn sweep_kinds(
        &self,
        now: Timestamp,
        report: &mut SweepReport,
        plan: &mut InvalidationPlan,
    ) -> StorageResult<()> {
        for kind in RecordKind::ALL {
            let cutoff = self.config.cutoff(kind, now);
            if cutoff == Timestamp::EPOCH {
                continue;
            }
            let expired = TimeRange { start: None, end: Some(Timestamp::from_nanos(cutoff.as_nanos() - 1)) };
            let hits = self.index.lookup(&Dimension::Time(kind), expired).await?;
            debug!(%kind, %cutoff, candidates = hits.len(), "sweeping expired records");
            for hit in hits {
                match self.remove_record(kind, &hit, plan).await {
                    Ok(Removal::Record { members }) => {
                        report.count(kind);
                        report.index_members += members;
                    },
                    Ok(Removal::Superseded { members }) => report.index_members += members,
                    Err(err) => {
                        warn!(record_key = %hit.record_key, error = %err, "failed to remove expired record");
                        report.failures += 1;
                    },
                }
            }
        }
        Ok(())
    }

    /// Evicts oldest records, in `(timestamp, key)` order across all kinds,
    /// until the store is within `max_records` and `max_bytes`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the time index cannot be scanned.
    #[tracing::instrument(skip(self, sink))]
    pub async fn evict_to_capacity(&self, sink: &dyn InvalidationSink) -> StorageResult<EvictionReport> {
        if self.config.max_records.is_none() && self.config.max_bytes.is_none() {
            return Ok(EvictionReport::default());
        }
        let mut hits = Vec::new();
        for kind in RecordKind::ALL {
            let kind_hits = self.index.lookup(&Dimension::Time(kind), TimeRange::all()).await?;
            hits.extend(kind_hits.into_iter().map(|hit| (kind, hit)));
        }
        hits.sort_by(|(_, a), (_, b)| {
            (a.timestamp, &a.record_key).cmp(&(b.timestamp, &b.record_key))
        });

        let mut records = hits.len() as u64;
        let mut bytes: u64 = hits.iter().map(|(_, hit)| hit.size).sum();
        let mut report = EvictionReport::default();
        let mut plan = InvalidationPlan::default();

        for (kind, hit) in &hits {
            if self.within_capacity(records, bytes) {
                break;
            }
            match self.remove_record(*kind, hit, &mut plan).await {
                Ok(Removal::Record { .. }) => {
                    report.evicted += 1;
                    report.bytes_freed += hit.size;
                    records -= 1;
                    bytes = bytes.saturating_sub(hit.size);
                },
                // The leftover member was counted but held no record of its own.
                Ok(Removal::Superseded { .. }) => {
                    records -= 1;
                    bytes = bytes.saturating_sub(hit.size);
                },
                Err(err) => {
                    warn!(record_key = %hit.record_key, error = %err, "failed to evict record");
                },
            }
        }

        report.remaining_records = records;
        report.remaining_bytes = bytes;
        plan.apply(sink).await;
        self.metrics.record_evicted(report.evicted);
        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                remaining_records = records,
                "capacity eviction complete"
            );
        }
        Ok(report)
    }

    /// Current stored volume.
    ///
    /// # Errors
    ///
    /// Returns the scan error.
    pub async fn capacity_usage(&self) -> StorageResult<CapacityUsage> {
        let mut usage = CapacityUsage::default();
        for kind in RecordKind::ALL {
            for hit in self.index.lookup(&Dimension::Time(kind), TimeRange::all()).await? {
                usage.records += 1;
                usage.bytes += hit.size;
            }
        }
        Ok(usage)
    }

    fn within_capacity(&self, records: u64, bytes: u64) -> bool {
        self.config.max_records.is_none_or(|max| records <= max)
            && self.config.max_bytes.is_none_or(|max| bytes <= max)
    }

    /// Deletes a record body and its index members.
    ///
    /// When the body was stored again at another timestamp the hit is a
    /// leftover member: only members at the hit's timestamp are dropped and
    /// the body stays.
    async fn remove_record(
        &self,
        kind: RecordKind,
        hit: &IndexHit,
        plan: &mut InvalidationPlan,
    ) -> StorageResult<Removal> {
        let time_dimension = Dimension::Time(kind);
        let dimensions = match self.client.get(&hit.record_key).await? {
            Some(bytes) => match self.codec.decode(&bytes, kind) {
                Ok(record) if record.timestamp() != hit.timestamp => {
                    plan.add(kind, record.trace_id());
                    let members = self.index.remove_from_index(hit, &dimensions_for(&record)).await?;
                    debug!(record_key = %hit.record_key, members, "dropped members of a superseded record");
                    return Ok(Removal::Superseded { members: members as u64 });
                },
                Ok(record) => {
                    plan.add(kind, record.trace_id());
                    dimensions_for(&record)
                },
                Err(err) => {
                    warn!(record_key = %hit.record_key, error = %err, "removing undecodable record");
                    plan.add(kind, keys::trace_id_of_span_key(&hit.record_key).as_deref());
                    vec![time_dimension]
                },
            },
            None => {
                plan.add(kind, keys::trace_id_of_span_key(&hit.record_key).as_deref());
                vec![time_dimension]
            },
        };
        self.client.delete(&hit.record_key).await?;
        let removed = self.index.remove_from_index(hit, &dimensions).await?;
        Ok(Removal::Record { members: removed as u64 })
    }
}

/// What [`RetentionManager::remove_record`] deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// The body and this many index members.
    Record { members: u64 },
    /// Only leftover members of a body stored again at another timestamp.
    Superseded { members: u64 },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        config::{ClientConfig, IndexConfig},
        memory::MemoryBackend,
        model::TelemetryRecord,
        testutil::{log_entry, metric_sample, span},
    };

    const MINUTE: u64 = 60_000_000_000;

    struct Fixture {
        backend: MemoryBackend,
        client: StoreClient<MemoryBackend>,
        index: Arc<IndexManager<MemoryBackend>>,
        codec: Codec,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = MemoryBackend::new();
            let client = StoreClient::new(backend.clone(), ClientConfig::default(), Metrics::new());
            let index = Arc::new(IndexManager::new(client.clone(), IndexConfig::default()));
            Self { backend, client, index, codec: Codec::default() }
        }

        fn retention(&self, config: RetentionConfig) -> RetentionManager<MemoryBackend> {
            RetentionManager::new(
                self.client.clone(),
                Arc::clone(&self.index),
                self.codec.clone(),
                config,
                Metrics::new(),
            )
        }

        async fn store(&self, record: TelemetryRecord) {
            let bytes = self.codec.encode(&record).unwrap();
            self.client.put(&record.record_key(), bytes.clone(), None).await.unwrap();
            self.index.index_record(&record, bytes.len() as u64, None).await.unwrap();
        }
    }

    fn windows(minutes: u64) -> RetentionConfig {
        let window = Duration::from_secs(minutes * 60);
        RetentionConfig::builder()
            .span_window(window)
            .log_window(window)
            .metric_window(window)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cutoff_boundary() {
        let fx = Fixture::new();
        let now = Timestamp::from_nanos(100 * MINUTE);
        let cutoff = 70 * MINUTE;
        fx.store(log_entry("at", "api", cutoff).into()).await;
        fx.store(log_entry("older", "api", cutoff - 1_000).into()).await;

        let report = fx.retention(windows(30)).sweep(now, &()).await.unwrap();
        assert_eq!(report.logs, 1);
        assert!(fx.backend.get("log:at").await.unwrap().is_some());
        assert!(fx.backend.get("log:older").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_and_removes_members() {
        let fx = Fixture::new();
        fx.store(span("t1", "root", None, "api", MINUTE).into()).await;
        fx.store(span("t1", "child", Some("root"), "db", MINUTE + 5).into()).await;
        fx.store(metric_sample("m1", "api", "cpu", 1.0, MINUTE).into()).await;

        let retention = fx.retention(windows(30));
        let now = Timestamp::from_nanos(60 * MINUTE);
        let first = retention.sweep(now, &()).await.unwrap();
        assert_eq!((first.spans, first.metrics), (2, 1));
        assert_eq!(first.index_members, 9);
        assert!(fx.backend.is_empty());

        let second = retention.sweep(now, &()).await.unwrap();
        assert_eq!(second, SweepReport::default());
    }

    #[tokio::test]
    async fn test_missing_body_still_drops_time_member() {
        let fx = Fixture::new();
        fx.store(log_entry("gone", "api", MINUTE).into()).await;
        fx.backend.delete("log:gone").await.unwrap();

        let report = fx.retention(windows(30)).sweep(Timestamp::from_nanos(60 * MINUTE), &()).await.unwrap();
        assert_eq!(report.logs, 1);
        assert_eq!(report.index_members, 1);
        let remaining = fx.index.lookup(&Dimension::Time(RecordKind::Log), TimeRange::all()).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_removed() {
        let fx = Fixture::new();
        fx.store(log_entry("bad", "api", MINUTE).into()).await;
        fx.client.put("log:bad", Bytes::from_static(b"garbage"), None).await.unwrap();

        let report = fx.retention(windows(30)).sweep(Timestamp::from_nanos(60 * MINUTE), &()).await.unwrap();
        assert_eq!(report.logs, 1);
        assert!(fx.backend.get("log:bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leftover_member_does_not_remove_newer_body() {
        let fx = Fixture::new();
        fx.store(span("t1", "s1", None, "api", MINUTE).into()).await;
        fx.store(span("t1", "s1", None, "api", 50 * MINUTE).into()).await;

        let report = fx.retention(windows(30)).sweep(Timestamp::from_nanos(60 * MINUTE), &()).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(report.index_members, 3);
        assert!(fx.backend.get("span:t1:s1").await.unwrap().is_some());
        for dimension in dimensions_for(&span("t1", "s1", None, "api", 50 * MINUTE).into()) {
            let hits = fx.index.lookup(&dimension, TimeRange::all()).await.unwrap();
            assert_eq!(hits.len(), 1, "{dimension}");
            assert_eq!(hits[0].timestamp, Timestamp::from_nanos(50 * MINUTE));
        }
    }

    #[tokio::test]
    async fn test_leftover_member_counts_toward_capacity_once() {
        let fx = Fixture::new();
        fx.store(log_entry("l1", "api", MINUTE).into()).await;
        fx.store(log_entry("l1", "api", 3 * MINUTE).into()).await;
        fx.store(log_entry("l2", "api", 2 * MINUTE).into()).await;

        let config = RetentionConfig::builder().max_records(2).build().unwrap();
        let report = fx.retention(config).evict_to_capacity(&()).await.unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.remaining_records, 2);
        assert!(fx.backend.get("log:l1").await.unwrap().is_some());
        assert!(fx.backend.get("log:l2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evicts_oldest_first_across_kinds() {
        let fx = Fixture::new();
        fx.store(log_entry("l2", "api", 2 * MINUTE).into()).await;
        fx.store(span("t1", "s1", None, "api", MINUTE).into()).await;
        fx.store(metric_sample("m3", "api", "cpu", 1.0, 3 * MINUTE).into()).await;
        fx.store(log_entry("l4", "api", 4 * MINUTE).into()).await;

        let config = RetentionConfig::builder().max_records(2).build().unwrap();
        let retention = fx.retention(config);
        let report = retention.evict_to_capacity(&()).await.unwrap();
        assert_eq!(report.evicted, 2);
        assert_eq!(report.remaining_records, 2);
        assert!(fx.backend.get("span:t1:s1").await.unwrap().is_none());
        assert!(fx.backend.get("log:l2").await.unwrap().is_none());
        assert!(fx.backend.get("log:l4").await.unwrap().is_some());

        let usage = retention.capacity_usage().await.unwrap();
        assert_eq!(usage.records, 2);
        assert_eq!(usage.bytes, report.remaining_bytes);
    }

    #[tokio::test]
    async fn test_byte_ceiling() {
        let fx = Fixture::new();
        for i in 0..4 {
            fx.store(log_entry(&format!("l{i}"), "api", (i + 1) * MINUTE).into()).await;
        }
        let retention = fx.retention(RetentionConfig::default());
        let usage = retention.capacity_usage().await.unwrap();
        let per_record = usage.bytes / usage.records;

        let config = RetentionConfig::builder().max_bytes(per_record * 2).build().unwrap();
        let report = fx.retention(config).evict_to_capacity(&()).await.unwrap();
        assert!(report.remaining_bytes <= per_record * 2);
        assert!(fx.backend.get("log:l3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_ceiling_is_noop() {
        let fx = Fixture::new();
        fx.store(log_entry("l1", "api", MINUTE).into()).await;
        let report = fx.retention(RetentionConfig::default()).evict_to_capacity(&()).await.unwrap();
        assert_eq!(report, EvictionReport::default());
    }
}
