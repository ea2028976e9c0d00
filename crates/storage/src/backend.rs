//! Backing-store trait.
//!
//! [`StoreBackend`] is the minimal remote key-value interface the engine
//! needs: point reads and writes with an optional TTL, deletes, absolute
//! expiry and cursor-paged prefix scans. Keys are UTF-8 strings (see
//! [`keys`](crate::keys)); values are opaque bytes.
//!
//! Implementations:
//!
//! | Backend | Crate | Use |
//! |---------|-------|-----|
//! | [`MemoryBackend`](crate::MemoryBackend) | this crate | tests, single-process deployments |
//! | `RedisBackend` | `tinyolly-common-storage-redis` | production |
//!
//! Backends do not retry. Retries, deadlines and concurrency bounds are the
//! job of [`StoreClient`](crate::StoreClient). A backend maps its native
//! errors onto [`StorageError`](crate::StorageError), using `Connection` for
//! anything worth retrying.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    error::StorageResult,
    health::{HealthProbe, HealthStatus},
};

/// A key and its value, as returned by prefix scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key.
    pub key: String,
    /// Stored value.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new pair.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Entries in this page, in ascending key order for ordered backends.
    pub entries: Vec<KeyValue>,
    /// Cursor for the next page; `None` when the scan is complete.
    pub next_cursor: Option<String>,
}

impl ScanPage {
    /// Returns `true` if no further pages follow.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Remote key-value store used by the storage engine.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Short backend identifier used in logs and health metadata.
    fn name(&self) -> &'static str;

    /// Reads a key. Absent or expired keys return `Ok(None)`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Writes a key, replacing any previous value. With `ttl`, the store
    /// removes the key once it elapses; without, any previous expiry is
    /// cleared.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StorageResult<()>;

    /// Deletes a key. Returns `true` if it existed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Returns up to `limit` entries whose key starts with `prefix`.
    ///
    /// `cursor` is `None` for the first page and otherwise the
    /// [`ScanPage::next_cursor`] of the previous page. Cursors are opaque and
    /// backend-specific. `limit` is a page-size hint: a page may hold fewer
    /// entries while more remain, or a few more than asked. Only a `None`
    /// cursor ends the scan. A key may appear on more than one page, and keys
    /// written during a scan may or may not be returned.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage>;

    /// Sets an absolute expiry on an existing key. Returns `false` if the key
    /// does not exist. An instant in the past removes the key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> StorageResult<bool>;

    /// Probes backend health.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus>;
}
