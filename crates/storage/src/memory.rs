//! In-memory backing store.
//!
//! [`MemoryBackend`] keeps every key in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`], so prefix scans come back in key order. Keys
//! written with a TTL are tracked in a second map and removed by a background
//! task. Reads treat an expired key as absent even before the task reaps it.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use tinyolly_common_storage::{MemoryBackend, StoreBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!     backend.put("log:l-1", Bytes::from_static(b"hello"), None).await.unwrap();
//!     let page = backend.scan_prefix("log:", None, 10).await.unwrap();
//!     assert_eq!(page.entries.len(), 1);
//! }
//! ```
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | get / put / delete | O(log n) |
//! | scan_prefix | O(log n + k) for a page of k |

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::{KeyValue, ScanPage, StoreBackend},
    error::StorageResult,
    health::{HealthMetadata, HealthProbe, HealthStatus},
};

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Closes the watch channel when the last backend clone is dropped, which
/// stops the cleanup task.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory [`StoreBackend`].
///
/// Clones share the same data. The cleanup task stops when every clone is
/// dropped or [`shutdown`](Self::shutdown) is called. Must be created inside
/// a Tokio runtime.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Bytes>>>,
    ttl_data: Arc<RwLock<HashMap<String, Instant>>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryBackend {
    /// Creates an empty backend that reaps expired keys every second.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cleanup_interval(DEFAULT_CLEANUP_INTERVAL)
    }

    /// Creates an empty backend with a custom reaper period.
    #[must_use]
    pub fn with_cleanup_interval(interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            ttl_data: Arc::new(RwLock::new(HashMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task holds only the maps, so dropping every backend clone
        // drops the guard and ends the loop.
        let data = Arc::clone(&backend.data);
        let ttl_data = Arc::clone(&backend.ttl_data);
        tokio::spawn(cleanup_expired_keys(data, ttl_data, interval, shutdown_rx));

        backend
    }

    /// Stops the background cleanup task. Idempotent. The backend stays
    /// usable; expired keys are still hidden from reads.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of stored keys, including expired keys not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Snapshot of all live keys, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let data = self.data.read();
        data.keys().filter(|k| !self.is_expired(k)).cloned().collect()
    }

    fn is_expired(&self, key: &str) -> bool {
        self.ttl_data.read().get(key).is_some_and(|expiry| *expiry <= Instant::now())
    }

    fn remove(&self, key: &str) -> bool {
        let mut data = self.data.write();
        let mut ttl_data = self.ttl_data.write();
        let expired = ttl_data.remove(key).is_some_and(|expiry| expiry <= Instant::now());
        data.remove(key).is_some() && !expired
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn cleanup_expired_keys(
    data: Arc<RwLock<BTreeMap<String, Bytes>>>,
    ttl_data: Arc<RwLock<HashMap<String, Instant>>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => return,
        }

        let now = Instant::now();
        let expired: Vec<String> = ttl_data
            .read()
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            // Lock order: data, then ttl_data.
            let mut data = data.write();
            let mut ttl = ttl_data.write();
            for key in expired {
                // Re-check: the key may have been rewritten since the scan.
                if ttl.get(&key).is_some_and(|expiry| *expiry <= now) {
                    data.remove(&key);
                    ttl.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        if self.is_expired(key) {
            return Ok(None);
        }
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StorageResult<()> {
        let mut data = self.data.write();
        let mut ttl_data = self.ttl_data.write();
        match ttl {
            Some(ttl) if ttl.is_zero() => {
                data.remove(key);
                ttl_data.remove(key);
            },
            Some(ttl) => {
                data.insert(key.to_owned(), value);
                ttl_data.insert(key.to_owned(), Instant::now() + ttl);
            },
            None => {
                data.insert(key.to_owned(), value);
                ttl_data.remove(key);
            },
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.remove(key))
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        let limit = limit.max(1);
        let start = match cursor {
            Some(c) if c >= prefix => Bound::Excluded(c),
            _ => Bound::Included(prefix),
        };

        let data = self.data.read();
        let mut entries: Vec<KeyValue> = data
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| !self.is_expired(key))
            .take(limit + 1)
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
            .collect();

        let next_cursor = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|kv| kv.key.clone())
        } else {
            None
        };
        Ok(ScanPage { entries, next_cursor })
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        if self.is_expired(key) || !self.data.read().contains_key(key) {
            return Ok(false);
        }
        match (at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => {
                self.ttl_data.write().insert(key.to_owned(), Instant::now() + remaining);
            },
            _ => {
                self.remove(key);
            },
        }
        Ok(true)
    }

    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        let start = Instant::now();
        let entry_count = self.data.read().len();
        let metadata = HealthMetadata::new(start.elapsed(), self.name())
            .with_detail("entry_count", entry_count)
            .with_detail("probe", probe);
        Ok(HealthStatus::healthy(metadata))
    }
}
