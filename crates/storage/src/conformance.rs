//! Conformance suite for [`StoreBackend`] implementations.
//!
//! Every backend, in-memory or remote, runs the same async checks so the
//! storage engine can rely on one contract. Each function expects a fresh,
//! empty backend.
//!
//! ```no_run
//! use tinyolly_common_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn get_missing_key() {
//!     conformance::kv_get_missing_returns_none(&MemoryBackend::new()).await;
//! }
//! ```
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | KV | get/put/delete semantics |
//! | Scan | prefix isolation, paging, cursor termination |
//! | TTL | relative and absolute expiry |
//! | Concurrent | parallel writers |
//! | Health | probes answer on a live backend |

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;

use crate::{backend::StoreBackend, health::HealthProbe};

async fn scan_all<B: StoreBackend>(backend: &B, prefix: &str, limit: usize) -> Vec<String> {
    let mut keys = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = backend.scan_prefix(prefix, cursor.as_deref(), limit).await.expect("scan page");
        keys.extend(page.entries.into_iter().map(|kv| kv.key));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    keys
}

// ───────────────────────────────────────────────────────────────────────────
// KV
// ───────────────────────────────────────────────────────────────────────────

/// `get` on a key that was never written returns `Ok(None)`.
pub async fn kv_get_missing_returns_none<B: StoreBackend>(backend: &B) {
    let value = backend.get("conf:missing").await.expect("get should not error on a missing key");
    assert_eq!(value, None);
}

/// `put` then `get` returns the value; a second `put` replaces it.
pub async fn kv_put_then_get_and_overwrite<B: StoreBackend>(backend: &B) {
    backend.put("conf:k", Bytes::from_static(b"v1"), None).await.expect("put");
    assert_eq!(backend.get("conf:k").await.expect("get"), Some(Bytes::from_static(b"v1")));
    backend.put("conf:k", Bytes::from_static(b"v2"), None).await.expect("overwrite");
    assert_eq!(backend.get("conf:k").await.expect("get"), Some(Bytes::from_static(b"v2")));
}

/// `delete` reports whether the key existed and removes it.
pub async fn kv_delete_reports_existence<B: StoreBackend>(backend: &B) {
    backend.put("conf:d", Bytes::from_static(b"x"), None).await.expect("put");
    assert!(backend.delete("conf:d").await.expect("delete"));
    assert!(!backend.delete("conf:d").await.expect("second delete"));
    assert_eq!(backend.get("conf:d").await.expect("get"), None);
}

/// Binary values, including empty ones, are stored unchanged.
pub async fn kv_binary_values_roundtrip<B: StoreBackend>(backend: &B) {
    let blob: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    backend.put("conf:blob", Bytes::from(blob.clone()), None).await.expect("put blob");
    backend.put("conf:empty", Bytes::new(), None).await.expect("put empty");
    assert_eq!(backend.get("conf:blob").await.expect("get blob"), Some(Bytes::from(blob)));
    assert_eq!(backend.get("conf:empty").await.expect("get empty"), Some(Bytes::new()));
}

// ───────────────────────────────────────────────────────────────────────────
// Scan
// ───────────────────────────────────────────────────────────────────────────

/// A prefix scan returns exactly the keys under the prefix.
pub async fn scan_is_prefix_isolated<B: StoreBackend>(backend: &B) {
    for key in ["conf:a:1", "conf:a:2", "conf:ab:1", "conf:b:1"] {
        backend.put(key, Bytes::from_static(b"v"), None).await.expect("put");
    }
    let mut keys = scan_all(backend, "conf:a:", 10).await;
    keys.sort();
    assert_eq!(keys, ["conf:a:1", "conf:a:2"]);
}

/// Paging with a small limit visits every key.
pub async fn scan_pages_cover_every_key<B: StoreBackend>(backend: &B) {
    let expected: BTreeSet<String> = (0..57).map(|i| format!("conf:page:{i:03}")).collect();
    for key in &expected {
        backend.put(key, Bytes::from_static(b"v"), None).await.expect("put");
    }
    let keys = scan_all(backend, "conf:page:", 5).await;
    let unique: BTreeSet<String> = keys.into_iter().collect();
    assert_eq!(unique, expected);
}

/// Scanning an empty prefix range terminates with no entries.
pub async fn scan_empty_prefix_terminates<B: StoreBackend>(backend: &B) {
    assert!(scan_all(backend, "conf:nothing:", 3).await.is_empty());
}

/// Scan entries carry their values.
pub async fn scan_returns_values<B: StoreBackend>(backend: &B) {
    backend.put("conf:val:x", Bytes::from_static(b"42"), None).await.expect("put");
    let page = backend.scan_prefix("conf:val:", None, 10).await.expect("scan");
    let entry = page.entries.iter().find(|kv| kv.key == "conf:val:x").expect("entry present");
    assert_eq!(entry.value, Bytes::from_static(b"42"));
}

// ───────────────────────────────────────────────────────────────────────────
// TTL
// ───────────────────────────────────────────────────────────────────────────

/// A key written with a TTL disappears after it elapses.
pub async fn ttl_key_expires<B: StoreBackend>(backend: &B) {
    backend
        .put("conf:ttl", Bytes::from_static(b"v"), Some(Duration::from_millis(50)))
        .await
        .expect("put with ttl");
    assert!(backend.get("conf:ttl").await.expect("get").is_some());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.get("conf:ttl").await.expect("get after expiry"), None);
    assert!(scan_all(backend, "conf:ttl", 10).await.is_empty(), "expired key visible to scans");
}

/// Rewriting a key without a TTL clears the previous expiry.
pub async fn ttl_cleared_by_plain_put<B: StoreBackend>(backend: &B) {
    backend
        .put("conf:persist", Bytes::from_static(b"v"), Some(Duration::from_millis(50)))
        .await
        .expect("put with ttl");
    backend.put("conf:persist", Bytes::from_static(b"v2"), None).await.expect("put without ttl");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        backend.get("conf:persist").await.expect("get"),
        Some(Bytes::from_static(b"v2"))
    );
}

/// `expire_at` applies to existing keys only, and a past instant removes the key.
pub async fn ttl_expire_at<B: StoreBackend>(backend: &B) {
    assert!(!backend.expire_at("conf:absent", Utc::now()).await.expect("expire_at absent"));

    backend.put("conf:future", Bytes::from_static(b"v"), None).await.expect("put");
    let later = Utc::now() + chrono::Duration::milliseconds(80);
    assert!(backend.expire_at("conf:future", later).await.expect("expire_at future"));
    assert!(backend.get("conf:future").await.expect("get").is_some());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.get("conf:future").await.expect("get after expiry"), None);

    backend.put("conf:past", Bytes::from_static(b"v"), None).await.expect("put");
    let earlier = Utc::now() - chrono::Duration::seconds(1);
    backend.expire_at("conf:past", earlier).await.expect("expire_at past");
    assert_eq!(backend.get("conf:past").await.expect("get"), None);
}

// ───────────────────────────────────────────────────────────────────────────
// Concurrent
// ───────────────────────────────────────────────────────────────────────────

/// Parallel writers to distinct keys all land.
pub async fn concurrent_writers_all_land<B: StoreBackend>(backend: Arc<B>) {
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .put(&format!("conf:par:{i:02}"), Bytes::from(i.to_string()), None)
                    .await
                    .expect("parallel put");
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("writer task");
    }
    assert_eq!(scan_all(backend.as_ref(), "conf:par:", 7).await.len(), 32);
}

// ───────────────────────────────────────────────────────────────────────────
// Health
// ───────────────────────────────────────────────────────────────────────────

/// Every probe reports a live backend as healthy and names the backend.
pub async fn health_probes_report_healthy<B: StoreBackend>(backend: &B) {
    for probe in [HealthProbe::Liveness, HealthProbe::Readiness, HealthProbe::Startup] {
        let status = backend.health_check(probe).await.expect("health check");
        assert!(status.is_healthy(), "{probe:?} probe unhealthy: {status:?}");
        assert!(!status.metadata().backend.is_empty(), "health metadata must name the backend");
    }
}

/// Runs the whole suite, one fresh backend per check.
pub async fn run_all<B, F>(mut fresh: F)
where
    B: StoreBackend,
    F: AsyncFnMut() -> B,
{
    kv_get_missing_returns_none(&fresh().await).await;
    kv_put_then_get_and_overwrite(&fresh().await).await;
    kv_delete_reports_existence(&fresh().await).await;
    kv_binary_values_roundtrip(&fresh().await).await;
    scan_is_prefix_isolated(&fresh().await).await;
    scan_pages_cover_every_key(&fresh().await).await;
    scan_empty_prefix_terminates(&fresh().await).await;
    scan_returns_values(&fresh().await).await;
    ttl_key_expires(&fresh().await).await;
    ttl_cleared_by_plain_put(&fresh().await).await;
    ttl_expire_at(&fresh().await).await;
    concurrent_writers_all_land(Arc::new(fresh().await)).await;
    health_probes_report_healthy(&fresh().await).await;
}
