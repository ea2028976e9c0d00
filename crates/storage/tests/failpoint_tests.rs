#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p tinyolly-common-storage --features failpoints --test failpoint_tests
//! ```

use std::time::{Duration, Instant};

use tinyolly_common_storage::{
    MemoryBackend, TelemetryError, TelemetryStore,
    testutil::{FaultInjectingBackend, ago, fast_config, span},
};

fn store() -> TelemetryStore<MemoryBackend> {
    TelemetryStore::new(MemoryBackend::new(), fast_config()).expect("valid config")
}

#[tokio::test]
async fn index_write_failpoint_marks_record_inconsistent() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("index-write-member", "return").expect("failed to configure fail point");

    let store = store();
    let result = store.ingest(span("t1", "a", None, "api", ago(Duration::from_secs(5))).into()).await;
    let Err(TelemetryError::IndexInconsistent { record_key, reason }) = result else {
        panic!("expected IndexInconsistent, got {result:?}");
    };
    assert_eq!(record_key, "span:t1:a");
    assert!(reason.contains("3 dimension(s)"), "unexpected reason: {reason}");

    fail::remove("index-write-member");
    let report = store.reconcile().await.expect("reconcile");
    assert_eq!(report.repaired, 1);
    assert!(store.get_trace("t1").await.expect("get trace").is_some());

    scenario.teardown();
}

#[tokio::test]
async fn single_index_write_failure_is_retried_in_place() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("index-write-member", "1*return->off").expect("failed to configure fail point");

    let store = store();
    store
        .ingest(span("t2", "a", None, "api", ago(Duration::from_secs(5))).into())
        .await
        .expect("retry of the failed dimension succeeds");
    assert_eq!(store.metrics().snapshot().index_inconsistent, 0);
    assert!(store.get_trace("t2").await.expect("get trace").is_some());

    scenario.teardown();
}

#[tokio::test]
async fn index_write_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured, so ingest succeeds normally

    let store = store();
    store
        .ingest(span("t3", "a", None, "api", ago(Duration::from_secs(5))).into())
        .await
        .expect("ingest");

    scenario.teardown();
}

#[tokio::test]
async fn retry_backoff_failpoint_delays_retry() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("retry-before-sleep", "sleep(60)").expect("failed to configure fail point");

    let backend = FaultInjectingBackend::new(MemoryBackend::new());
    let store = TelemetryStore::new(backend.clone(), fast_config()).expect("valid config");
    backend.fail_next(1);

    let started = Instant::now();
    store
        .ingest(span("t4", "a", None, "api", ago(Duration::from_secs(5))).into())
        .await
        .expect("ingest after one retry");
    assert!(started.elapsed() >= Duration::from_millis(60));

    scenario.teardown();
}
