//! Shared test utilities.
//!
//! Record builders, a fault-injecting backend wrapper and assertion macros.
//! Feature-gated behind `testutil` so none of it reaches production builds.
//!
//! ```toml
//! [dev-dependencies]
//! tinyolly-common-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    backend::{ScanPage, StoreBackend},
    config::{ClientConfig, RetryConfig, StorageConfig},
    error::{StorageError, StorageResult},
    health::{HealthProbe, HealthStatus},
    memory::MemoryBackend,
    model::{
        Attributes, LogEntry, MetricKind, MetricSample, Severity, Span, SpanKind, SpanStatus,
        Timestamp,
    },
};

// ───────────────────────────────────────────────────────────────────────────
// Record builders
// ───────────────────────────────────────────────────────────────────────────

/// A 1 ms span with `Ok` status.
#[must_use]
pub fn span(trace_id: &str, span_id: &str, parent: Option<&str>, service: &str, start_nanos: u64) -> Span {
    Span {
        trace_id: trace_id.into(),
        span_id: span_id.into(),
        parent_span_id: parent.map(Into::into),
        service_name: service.into(),
        operation_name: format!("{service} handle {span_id}"),
        start_time: Timestamp::from_nanos(start_nanos),
        duration_nanos: 1_000_000,
        status: SpanStatus::Ok,
        status_message: None,
        kind: if parent.is_some() { SpanKind::Client } else { SpanKind::Server },
        attributes: Attributes::new(),
        events: Vec::new(),
    }
}

/// An `Info` log entry without trace correlation.
#[must_use]
pub fn log_entry(id: &str, service: &str, ts_nanos: u64) -> LogEntry {
    LogEntry {
        id: id.into(),
        service_name: service.into(),
        timestamp: Timestamp::from_nanos(ts_nanos),
        trace_id: None,
        span_id: None,
        severity: Severity::Info,
        body: format!("log message {id}"),
        attributes: Attributes::new(),
    }
}

/// An unlabeled gauge sample.
#[must_use]
pub fn metric_sample(id: &str, service: &str, name: &str, value: f64, ts_nanos: u64) -> MetricSample {
    MetricSample {
        id: id.into(),
        service_name: service.into(),
        name: name.into(),
        value,
        timestamp: Timestamp::from_nanos(ts_nanos),
        labels: Default::default(),
        kind: MetricKind::Gauge,
        unit: None,
    }
}

/// Nanosecond timestamp `offset` before now, for records that must pass
/// ingest clock validation.
#[must_use]
pub fn ago(offset: Duration) -> u64 {
    Timestamp::now().saturating_sub(offset).as_nanos()
}

/// Storage config with millisecond retry backoff, for tests that exercise
/// failure paths without waiting.
#[must_use]
pub fn fast_config() -> StorageConfig {
    let retry = RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    StorageConfig {
        client: ClientConfig { op_timeout: Duration::from_millis(200), retry, ..ClientConfig::default() },
        ..StorageConfig::default()
    }
}

// ───────────────────────────────────────────────────────────────────────────
// FaultInjectingBackend
// ───────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FaultState {
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    failing_put_prefixes: Mutex<Vec<String>>,
    failing_scan_prefixes: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a FaultState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a FaultState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wraps a backend and injects latency and failures.
///
/// Clones share the same fault state.
#[derive(Clone)]
pub struct FaultInjectingBackend<B = MemoryBackend> {
    inner: B,
    state: Arc<FaultState>,
}

impl<B: StoreBackend> FaultInjectingBackend<B> {
    /// Wraps `inner` with no faults armed.
    #[must_use]
    pub fn new(inner: B) -> Self {
        Self { inner, state: Arc::new(FaultState::default()) }
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Fails the next `n` data operations with a transient connection error.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fails every operation, including health checks, until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails puts to keys under `prefix` with a non-transient error.
    pub fn fail_puts_with_prefix(&self, prefix: impl Into<String>) {
        self.state.failing_put_prefixes.lock().push(prefix.into());
    }

    /// Clears prefix-based put failures.
    pub fn clear_put_failures(&self) {
        self.state.failing_put_prefixes.lock().clear();
    }

    /// Fails scans whose prefix starts with `prefix` with a non-transient
    /// error.
    pub fn fail_scans_with_prefix(&self, prefix: impl Into<String>) {
        self.state.failing_scan_prefixes.lock().push(prefix.into());
    }

    /// Clears prefix-based scan failures.
    pub fn clear_scan_failures(&self) {
        self.state.failing_scan_prefixes.lock().clear();
    }

    /// Adds a delay before every operation.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Data operations attempted so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Highest number of operations observed in flight at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> StorageResult<()> {
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected outage"));
        }
        let armed = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StorageError::connection("injected transient failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: StoreBackend> StoreBackend for FaultInjectingBackend<B> {
    fn name(&self) -> &'static str {
        "fault-injecting"
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        self.before_call().await?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StorageResult<()> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        self.before_call().await?;
        let blocked = self.state.failing_put_prefixes.lock().iter().any(|p| key.starts_with(p.as_str()));
        if blocked {
            return Err(StorageError::internal(format!("injected write failure for {key}")));
        }
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        self.before_call().await?;
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> StorageResult<ScanPage> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        self.before_call().await?;
        let blocked = self.state.failing_scan_prefixes.lock().iter().any(|p| prefix.starts_with(p.as_str()));
        if blocked {
            return Err(StorageError::internal(format!("injected scan failure for {prefix}")));
        }
        self.inner.scan_prefix(prefix, cursor, limit).await
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        self.before_call().await?;
        self.inner.expire_at(key, at).await
    }

    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected outage"));
        }
        self.inner.health_check(probe).await
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Assertion macros
// ───────────────────────────────────────────────────────────────────────────

/// Assert that a result is a [`TelemetryError::StoreUnavailable`](crate::TelemetryError::StoreUnavailable).
#[macro_export]
macro_rules! assert_store_unavailable {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::TelemetryError::StoreUnavailable { .. })),
            "expected TelemetryError::StoreUnavailable, got: {:?}",
            $result,
        );
    };
}

/// Assert that a result is a [`TelemetryError::InvalidRecord`](crate::TelemetryError::InvalidRecord)
/// whose reason mentions `$needle`.
#[macro_export]
macro_rules! assert_invalid_record {
    ($result:expr, $needle:expr) => {
        match &$result {
            Err($crate::error::TelemetryError::InvalidRecord { reason }) => assert!(
                reason.contains($needle),
                "expected reason mentioning {:?}, got: {reason}",
                $needle,
            ),
            other => panic!("expected TelemetryError::InvalidRecord, got: {other:?}"),
        }
    };
}

/// Assert that a result is a [`TelemetryError::InvalidQuery`](crate::TelemetryError::InvalidQuery).
#[macro_export]
macro_rules! assert_invalid_query {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::TelemetryError::InvalidQuery { .. })),
            "expected TelemetryError::InvalidQuery, got: {:?}",
            $result,
        );
    };
}

/// Assert that a result is `Ok` and return the value.
#[macro_export]
macro_rules! assert_telemetry_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got: {e:?}", $msg),
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::TelemetryError;

    #[test]
    fn test_builders() {
        let s = span("t1", "s2", Some("s1"), "api", 5);
        assert_eq!(s.parent(), Some("s1"));
        assert_eq!(s.kind, SpanKind::Client);
        assert_eq!(log_entry("l1", "api", 5).severity, Severity::Info);
        assert_eq!(metric_sample("m1", "api", "cpu", 0.5, 5).value, 0.5);
        assert!(fast_config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        backend.fail_next(1);
        assert!(backend.get("k").await.unwrap_err().is_transient());
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_prefix_put_failures() {
        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        backend.fail_puts_with_prefix("idx:");
        let err = backend.put("idx:a", Bytes::new(), None).await.unwrap_err();
        assert!(!err.is_transient());
        backend.put("log:a", Bytes::new(), None).await.unwrap();
        backend.clear_put_failures();
        backend.put("idx:a", Bytes::new(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_prefix_scan_failures() {
        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        backend.fail_scans_with_prefix("idx:time:log:");
        assert!(backend.scan_prefix("idx:time:log:000001:", None, 10).await.is_err());
        assert!(backend.scan_prefix("idx:time:span:", None, 10).await.is_ok());
        backend.clear_scan_failures();
        assert!(backend.scan_prefix("idx:time:log:", None, 10).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_health() {
        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        backend.set_unavailable(true);
        assert!(backend.health_check(HealthProbe::Liveness).await.is_err());
        backend.set_unavailable(false);
        assert!(backend.health_check(HealthProbe::Liveness).await.unwrap().is_healthy());
    }

    #[test]
    fn test_macros() {
        let r: Result<(), TelemetryError> = Err(TelemetryError::invalid_record("missing span_id"));
        assert_invalid_record!(r, "span_id");
        let r: Result<(), TelemetryError> = Err(TelemetryError::invalid_query("bad token"));
        assert_invalid_query!(r);
        let r: Result<u8, TelemetryError> = Ok(3);
        assert_eq!(assert_telemetry_ok!(r), 3);
    }
}
