//! Store outages, partially indexed writes, reconciliation and query budgets.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use tinyolly_common_storage::{
    HealthProbe, LogQuery, MemoryBackend, StoreBackend, TelemetryError, TelemetryStore, TimeRange,
    assert_store_unavailable,
    testutil::{FaultInjectingBackend, ago, fast_config, log_entry, span},
};

type FaultyStore = TelemetryStore<FaultInjectingBackend>;

fn faulty_store() -> (FaultyStore, FaultInjectingBackend) {
    let backend = FaultInjectingBackend::new(MemoryBackend::new());
    let store = TelemetryStore::new(backend.clone(), fast_config()).expect("valid config");
    (store, backend)
}

#[tokio::test]
async fn outage_surfaces_store_unavailable_after_retries() {
    let (store, backend) = faulty_store();
    backend.set_unavailable(true);

    let result = store.ingest(log_entry("l1", "api", ago(Duration::from_secs(1))).into()).await;
    assert_store_unavailable!(result);
    // One attempt plus two retries for the body write.
    assert_eq!(backend.calls(), 3);

    let snapshot = store.metrics().snapshot();
    assert_eq!(snapshot.retries_exhausted, 1);
    assert_eq!(snapshot.ingest_rejected, 1);

    let query = store.query_logs(LogQuery::default()).await;
    assert_store_unavailable!(query);
    assert!(store.ping().await.is_err());
    assert!(store.health_check(HealthProbe::Readiness).await.is_unhealthy());
}

#[tokio::test]
async fn transient_failures_within_budget_are_absorbed() {
    let (store, backend) = faulty_store();
    backend.fail_next(2);

    let key = store
        .ingest(log_entry("l1", "api", ago(Duration::from_secs(1))).into())
        .await
        .expect("retries absorb two transient failures");
    assert!(store.get_record(&key).await.expect("read back").is_some());
    assert_eq!(store.metrics().snapshot().retries, 2);
}

#[tokio::test]
async fn batch_stops_writing_after_outage() {
    let (store, backend) = faulty_store();
    let ts = ago(Duration::from_secs(5));
    let records = (0..5).map(|i| log_entry(&format!("b{i}"), "api", ts + i).into()).collect();

    backend.set_unavailable(true);
    let report = store.ingest_batch(records).await;
    assert_eq!((report.accepted, report.rejected), (0, 5));
    assert_eq!(report.errors.len(), 5);
    assert!(report.errors.iter().all(|f| matches!(f.error, TelemetryError::StoreUnavailable { .. })));
    assert_eq!(backend.calls(), 3, "only the first record reached the store");
}

#[tokio::test]
async fn batch_reports_per_record_validation_errors() {
    let (store, _backend) = faulty_store();
    let ts = ago(Duration::from_secs(5));
    let mut bad = log_entry("bad", "api", ts);
    bad.service_name.clear();
    let records = vec![
        log_entry("ok-1", "api", ts).into(),
        bad.into(),
        log_entry("ok-2", "api", ts + 1).into(),
    ];

    let report = store.ingest_batch(records).await;
    assert_eq!((report.accepted, report.rejected), (2, 1));
    assert_eq!(report.errors[0].index, 1);
    assert_eq!(report.errors[0].id, "bad");
}

#[tokio::test]
async fn failed_index_write_leaves_record_pending_until_reconciled() {
    let (store, backend) = faulty_store();
    let t0 = ago(Duration::from_secs(30));
    backend.fail_puts_with_prefix("idx:trace:");

    let result = store.ingest(span("t1", "root", None, "api", t0).into()).await;
    let Err(TelemetryError::IndexInconsistent { record_key, .. }) = result else {
        panic!("expected IndexInconsistent, got {result:?}");
    };
    assert_eq!(record_key, "span:t1:root");

    // The body is stored and the other dimensions work.
    assert!(store.get_record(&record_key).await.expect("get").is_some());
    assert!(store.get_trace("t1").await.expect("get trace").is_none());
    let snapshot = store.metrics().snapshot();
    assert_eq!((snapshot.ingest_accepted, snapshot.index_inconsistent), (1, 1));

    let status = store.health_check(HealthProbe::Readiness).await;
    assert!(status.is_degraded());
    assert_eq!(store.stats().await.expect("stats").pending_reconciliation, 1);

    // Still failing: the marker stays.
    let report = store.reconcile().await.expect("reconcile");
    assert_eq!((report.repaired, report.failed), (0, 1));

    backend.clear_put_failures();
    let report = store.reconcile().await.expect("reconcile");
    assert_eq!(report.repaired, 1);
    assert_eq!(store.metrics().snapshot().reconciled, 1);

    let trace = store.get_trace("t1").await.expect("get trace").expect("trace visible after repair");
    assert_eq!(trace.span_count(), 1);
    assert!(store.health_check(HealthProbe::Readiness).await.is_healthy());
}

#[tokio::test]
async fn pending_markers_survive_a_new_store_instance() {
    let (store, backend) = faulty_store();
    backend.fail_puts_with_prefix("idx:service:");
    let result = store.ingest(log_entry("l1", "api", ago(Duration::from_secs(2))).into()).await;
    assert!(matches!(result, Err(TelemetryError::IndexInconsistent { .. })));
    backend.clear_put_failures();

    let restarted = TelemetryStore::new(backend.clone(), fast_config()).expect("valid config");
    let report = restarted.reconcile().await.expect("reconcile");
    assert_eq!(report.repaired, 1);

    let page = restarted
        .query_logs(LogQuery::builder().service("api").build())
        .await
        .expect("query");
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn missing_bodies_are_read_repaired() {
    let (store, backend) = faulty_store();
    let ts = ago(Duration::from_secs(10));
    let key = store.ingest(log_entry("gone", "api", ts).into()).await.expect("ingest");
    store.ingest(log_entry("kept", "api", ts + 1).into()).await.expect("ingest");

    // The store dropped the body behind the index's back.
    assert!(backend.inner().delete(&key).await.expect("delete body"));

    let page = store
        .query_logs(LogQuery::builder().service("api").build())
        .await
        .expect("query");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, "kept");

    let members: Vec<String> =
        backend.inner().keys().into_iter().filter(|k| k.starts_with("idx:service:log:api:")).collect();
    assert_eq!(members.len(), 1, "dangling service member removed: {members:?}");
    assert!(!members[0].ends_with(&key));
}

#[tokio::test]
async fn slow_store_hits_the_query_budget() {
    let mut config = fast_config();
    config.query.query_timeout = Duration::from_millis(30);
    let backend = FaultInjectingBackend::new(MemoryBackend::new());
    let store = TelemetryStore::new(backend.clone(), config).expect("valid config");
    store.ingest(span("t", "a", None, "api", ago(Duration::from_secs(1))).into()).await.expect("ingest");

    backend.set_latency(Duration::from_millis(80));
    let result = store.get_service_map(TimeRange::all()).await;
    assert!(
        matches!(result, Err(TelemetryError::Timeout { operation: "get_service_map", .. })),
        "expected query timeout, got {result:?}"
    );
    assert_eq!(store.metrics().snapshot().query_timeouts, 1);

    backend.set_latency(Duration::ZERO);
    assert_eq!(store.get_service_map(TimeRange::all()).await.expect("map").services, ["api"]);
}
