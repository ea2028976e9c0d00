//! Engine metrics.
//!
//! [`Metrics`] is a cheaply cloneable handle to a set of relaxed atomic
//! counters plus per-operation latency windows. The store client records
//! every backend round trip; the facade records ingest outcomes, cache
//! behavior, index inconsistencies, evictions and reconciliations.
//!
//! All counters use `Ordering::Relaxed`. Each is independent and monotonic,
//! so a snapshot may be slightly skewed across counters; that is fine for
//! telemetry.
//!
//! Latency percentiles come from a bounded window of the most recent 1024
//! samples per operation. Recording is an O(1) push under a short mutex;
//! sorting happens only at snapshot time.
//!
//! ```
//! use std::time::Duration;
//! use tinyolly_common_storage::Metrics;
//! use tinyolly_common_storage::metrics::StoreOp;
//!
//! let metrics = Metrics::new();
//! metrics.record_op(StoreOp::Get, Duration::from_micros(100));
//! metrics.record_cache_hit();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.op(StoreOp::Get).count, 1);
//! assert_eq!(snapshot.op(StoreOp::Get).percentiles.p50, 100);
//! assert_eq!(snapshot.cache_hit_rate(), 1.0);
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::warn;

const DEFAULT_HISTOGRAM_WINDOW_SIZE: usize = 1024;

// ── StoreOp ─────────────────────────────────────────────────────────────

/// A backing-store operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// Point read.
    Get,
    /// Write.
    Put,
    /// Delete.
    Delete,
    /// One prefix-scan page.
    Scan,
    /// Absolute expiry.
    ExpireAt,
    /// Liveness ping or health probe.
    Ping,
}

impl StoreOp {
    /// All operation types.
    pub const ALL: [Self; 6] =
        [Self::Get, Self::Put, Self::Delete, Self::Scan, Self::ExpireAt, Self::Ping];

    /// Stable name used in logs and spans.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Scan => "scan",
            Self::ExpireAt => "expire_at",
            Self::Ping => "ping",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Get => 0,
            Self::Put => 1,
            Self::Delete => 2,
            Self::Scan => 3,
            Self::ExpireAt => 4,
            Self::Ping => 5,
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── LatencyPercentiles ──────────────────────────────────────────────────

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    /// Median.
    pub p50: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
}

// ── LatencyHistogram ────────────────────────────────────────────────────

/// Circular buffer of the most recent latency samples.
pub(crate) struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    buf: Vec<u64>,
    pos: usize,
    capacity: usize,
}

impl LatencyHistogram {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { inner: Mutex::new(HistogramInner { buf: Vec::with_capacity(capacity), pos: 0, capacity }) }
    }

    pub(crate) fn record(&self, value_us: u64) {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(value_us);
        } else {
            inner.buf[pos] = value_us;
        }
        inner.pos = (pos + 1) % inner.capacity;
    }

    pub(crate) fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted = self.inner.lock().buf.clone();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.pos = 0;
    }
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped.
fn percentile_index(len: usize, percentile: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = (u64::from(percentile) * len as u64).div_ceil(100) as usize;
    rank.saturating_sub(1).min(len - 1)
}

// ── Per-operation stats ─────────────────────────────────────────────────

struct OpStats {
    count: AtomicU64,
    errors: AtomicU64,
    latency_us: AtomicU64,
    histogram: LatencyHistogram,
}

impl OpStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            histogram: LatencyHistogram::new(DEFAULT_HISTOGRAM_WINDOW_SIZE),
        }
    }

    fn snapshot(&self) -> OpSnapshot {
        OpSnapshot {
            count: self.count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latency_us: self.latency_us.load(Ordering::Relaxed),
            percentiles: self.histogram.percentiles(),
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latency_us.store(0, Ordering::Relaxed);
        self.histogram.reset();
    }
}

/// Point-in-time stats for one [`StoreOp`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSnapshot {
    /// Completed operations, successful or not.
    pub count: u64,
    /// Failed operations.
    pub errors: u64,
    /// Cumulative latency in microseconds.
    pub latency_us: u64,
    /// Recent latency percentiles.
    pub percentiles: LatencyPercentiles,
}

impl OpSnapshot {
    /// Mean latency in microseconds, zero when nothing was recorded.
    #[must_use]
    pub fn avg_latency_us(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.latency_us as f64 / self.count as f64 }
    }
}

// ── MetricsSnapshot ─────────────────────────────────────────────────────

/// Exported view of [`Metrics`].
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct MetricsSnapshot {
    /// Per-operation stats, indexed in [`StoreOp::ALL`] order.
    #[builder(default)]
    pub ops: [OpSnapshot; 6],
    /// Attempt timeouts.
    #[builder(default)]
    pub timeouts: u64,
    /// Retries after transient failures.
    #[builder(default)]
    pub retries: u64,
    /// Operations that exhausted the retry budget.
    #[builder(default)]
    pub retries_exhausted: u64,
    /// Read-through cache hits.
    #[builder(default)]
    pub cache_hits: u64,
    /// Read-through cache misses.
    #[builder(default)]
    pub cache_misses: u64,
    /// Records accepted by ingest.
    #[builder(default)]
    pub ingest_accepted: u64,
    /// Records rejected by ingest validation or store failure.
    #[builder(default)]
    pub ingest_rejected: u64,
    /// Records persisted with an incomplete index.
    #[builder(default)]
    pub index_inconsistent: u64,
    /// Records re-indexed by reconciliation.
    #[builder(default)]
    pub reconciled: u64,
    /// Records removed by retention sweeps.
    #[builder(default)]
    pub expired: u64,
    /// Records removed to honor capacity ceilings.
    #[builder(default)]
    pub evicted: u64,
    /// Queries that exceeded their time budget.
    #[builder(default)]
    pub query_timeouts: u64,
}

impl MetricsSnapshot {
    /// Stats for one operation type.
    #[must_use]
    pub fn op(&self, op: StoreOp) -> &OpSnapshot {
        &self.ops[op.index()]
    }

    /// Total store operations.
    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.ops.iter().map(|o| o.count).sum()
    }

    /// Total failed store operations.
    #[must_use]
    pub fn total_errors(&self) -> u64 {
        self.ops.iter().map(|o| o.errors).sum()
    }

    /// Failed fraction of store operations.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.total_operations();
        if total == 0 { 0.0 } else { self.total_errors() as f64 / total as f64 }
    }

    /// Hit fraction of cache lookups.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 { 0.0 } else { self.cache_hits as f64 / total as f64 }
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Shared metrics handle. Clones record into the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    ops: [OpStats; 6],
    timeouts: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    ingest_accepted: AtomicU64,
    ingest_rejected: AtomicU64,
    index_inconsistent: AtomicU64,
    reconciled: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    query_timeouts: AtomicU64,
}

impl Metrics {
    /// Creates a zeroed metrics collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                ops: std::array::from_fn(|_| OpStats::new()),
                timeouts: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                retries_exhausted: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                ingest_accepted: AtomicU64::new(0),
                ingest_rejected: AtomicU64::new(0),
                index_inconsistent: AtomicU64::new(0),
                reconciled: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                query_timeouts: AtomicU64::new(0),
            }),
        }
    }

    /// Records a completed store operation.
    pub fn record_op(&self, op: StoreOp, duration: Duration) {
        let us = duration.as_micros() as u64;
        let stats = &self.inner.ops[op.index()];
        stats.count.fetch_add(1, Ordering::Relaxed);
        stats.latency_us.fetch_add(us, Ordering::Relaxed);
        stats.histogram.record(us);
    }

    /// Records a failed store operation. Call in addition to
    /// [`record_op`](Self::record_op).
    pub fn record_op_error(&self, op: StoreOp) {
        self.inner.ops[op.index()].errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an attempt timeout.
    pub fn record_timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retry after a transient failure.
    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation that ran out of retries.
    pub fn record_retry_exhausted(&self) {
        self.inner.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache miss.
    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an accepted record.
    pub fn record_ingest_accepted(&self) {
        self.inner.ingest_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rejected record.
    pub fn record_ingest_rejected(&self) {
        self.inner.ingest_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a record persisted with an incomplete index.
    pub fn record_index_inconsistent(&self) {
        self.inner.index_inconsistent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records re-indexed records.
    pub fn record_reconciled(&self, count: u64) {
        self.inner.reconciled.fetch_add(count, Ordering::Relaxed);
    }

    /// Records records removed by a retention sweep.
    pub fn record_expired(&self, count: u64) {
        self.inner.expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Records records removed for capacity.
    pub fn record_evicted(&self, count: u64) {
        self.inner.evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a query that exceeded its budget.
    pub fn record_query_timeout(&self) {
        self.inner.query_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            ops: std::array::from_fn(|n| i.ops[n].snapshot()),
            timeouts: i.timeouts.load(Ordering::Relaxed),
            retries: i.retries.load(Ordering::Relaxed),
            retries_exhausted: i.retries_exhausted.load(Ordering::Relaxed),
            cache_hits: i.cache_hits.load(Ordering::Relaxed),
            cache_misses: i.cache_misses.load(Ordering::Relaxed),
            ingest_accepted: i.ingest_accepted.load(Ordering::Relaxed),
            ingest_rejected: i.ingest_rejected.load(Ordering::Relaxed),
            index_inconsistent: i.index_inconsistent.load(Ordering::Relaxed),
            reconciled: i.reconciled.load(Ordering::Relaxed),
            expired: i.expired.load(Ordering::Relaxed),
            evicted: i.evicted.load(Ordering::Relaxed),
            query_timeouts: i.query_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter and latency window.
    pub fn reset(&self) {
        let i = &self.inner;
        for op in &i.ops {
            op.reset();
        }
        for counter in [
            &i.timeouts,
            &i.retries,
            &i.retries_exhausted,
            &i.cache_hits,
            &i.cache_misses,
            &i.ingest_accepted,
            &i.ingest_rejected,
            &i.index_inconsistent,
            &i.reconciled,
            &i.expired,
            &i.evicted,
            &i.query_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Logs a snapshot at INFO, with warnings for elevated error rates,
    /// exhausted retries and index inconsistencies.
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        if s.total_operations() == 0 && s.ingest_accepted == 0 {
            return;
        }

        let get = s.op(StoreOp::Get);
        let put = s.op(StoreOp::Put);
        tracing::info!(
            total_ops = s.total_operations(),
            get_count = get.count,
            put_count = put.count,
            scan_count = s.op(StoreOp::Scan).count,
            get_p99_us = get.percentiles.p99,
            put_p99_us = put.percentiles.p99,
            error_rate = s.error_rate(),
            retries = s.retries,
            cache_hit_rate = s.cache_hit_rate(),
            ingest_accepted = s.ingest_accepted,
            ingest_rejected = s.ingest_rejected,
            expired = s.expired,
            evicted = s.evicted,
            "Telemetry storage metrics snapshot"
        );

        if s.error_rate() > 0.05 {
            warn!(
                error_rate = s.error_rate(),
                errors = s.total_errors(),
                total_ops = s.total_operations(),
                "High backing store error rate detected"
            );
        }
        if s.retries_exhausted > 0 {
            warn!(retries_exhausted = s.retries_exhausted, "Store operations exhausted retries");
        }
        if s.index_inconsistent > s.reconciled {
            warn!(
                index_inconsistent = s.index_inconsistent,
                reconciled = s.reconciled,
                "Records awaiting index reconciliation"
            );
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_histogram_empty_percentiles() {
        let h = LatencyHistogram::new(16);
        assert_eq!(h.percentiles(), LatencyPercentiles::default());
    }

    #[test]
    fn test_histogram_known_distribution() {
        let h = LatencyHistogram::new(100);
        for v in 1..=100 {
            h.record(v);
        }
        let p = h.percentiles();
        assert_eq!((p.p50, p.p95, p.p99), (50, 95, 99));
    }

    #[test]
    fn test_histogram_circular_eviction() {
        let h = LatencyHistogram::new(4);
        for v in [1000, 1000, 1000, 1000, 1, 2, 3, 4] {
            h.record(v);
        }
        assert_eq!(h.percentiles().p99, 4);
    }

    #[rstest]
    #[case(0, 50, 0)]
    #[case(1, 99, 0)]
    #[case(10, 50, 4)]
    #[case(10, 99, 9)]
    #[case(1000, 95, 949)]
    fn test_percentile_index(#[case] len: usize, #[case] pct: u32, #[case] expected: usize) {
        assert_eq!(percentile_index(len, pct), expected);
    }

    #[test]
    fn test_record_op_and_errors() {
        let metrics = Metrics::new();
        metrics.record_op(StoreOp::Put, Duration::from_micros(200));
        metrics.record_op(StoreOp::Put, Duration::from_micros(400));
        metrics.record_op_error(StoreOp::Put);
        metrics.record_op(StoreOp::Get, Duration::from_micros(10));

        let s = metrics.snapshot();
        assert_eq!(s.op(StoreOp::Put).count, 2);
        assert_eq!(s.op(StoreOp::Put).avg_latency_us(), 300.0);
        assert_eq!(s.total_operations(), 3);
        assert!((s.error_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(s.op(StoreOp::Delete).avg_latency_us(), 0.0);
    }

    #[test]
    fn test_engine_counters() {
        let metrics = Metrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_ingest_accepted();
        metrics.record_index_inconsistent();
        metrics.record_reconciled(1);
        metrics.record_expired(5);
        metrics.record_evicted(2);

        let s = metrics.snapshot();
        assert!((s.cache_hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!((s.expired, s.evicted, s.reconciled), (5, 2, 1));
    }

    #[test]
    fn test_clones_share_and_reset_clears() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_retry();
        clone.record_op(StoreOp::Scan, Duration::from_micros(5));
        assert_eq!(metrics.snapshot().retries, 1);

        metrics.reset();
        let s = clone.snapshot();
        assert_eq!(s.retries, 0);
        assert_eq!(s.total_operations(), 0);
        assert_eq!(s.op(StoreOp::Scan).percentiles, LatencyPercentiles::default());
    }

    #[test]
    fn test_log_metrics_does_not_panic() {
        let metrics = Metrics::new();
        metrics.log_metrics();
        metrics.record_op(StoreOp::Get, Duration::from_micros(1));
        metrics.record_op_error(StoreOp::Get);
        metrics.record_index_inconsistent();
        metrics.log_metrics();
    }

    #[test]
    fn test_snapshot_builder() {
        let s = MetricsSnapshot::builder().cache_hits(3).cache_misses(1).build();
        assert_eq!(s.cache_hit_rate(), 0.75);
    }
}
