//! Retrying, bounded client over a [`StoreBackend`].
//!
//! [`StoreClient`] is the only path from the engine to the backing store. For
//! every operation it:
//!
//! 1. waits for one of `max_in_flight` slots per attempt (excess callers
//!    queue, and a caller sleeping between retries holds no slot);
//! 2. runs the backend call under the per-attempt `op_timeout`;
//! 3. retries transient failures with exponential backoff (see
//!    [`with_retry`](crate::retry::with_retry)), surfacing
//!    [`StorageError::Unavailable`] once the budget is spent;
//! 4. records latency and outcome in [`Metrics`].
//!
//! Writes are at-least-once: an attempt that timed out may still have been
//! applied by the store, so every write the engine issues is idempotent.

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use crate::{
    backend::{KeyValue, ScanPage, StoreBackend},
    config::ClientConfig,
    error::{StorageError, StorageResult},
    health::{HealthMetadata, HealthProbe, HealthStatus},
    metrics::{Metrics, StoreOp},
    retry::with_retry,
};

/// Shared handle to the backing store. Clones share the backend, the
/// concurrency bound and the metrics.
pub struct StoreClient<B> {
    inner: Arc<ClientInner<B>>,
}

struct ClientInner<B> {
    backend: B,
    config: ClientConfig,
    permits: Semaphore,
    metrics: Metrics,
}

impl<B> Clone for StoreClient<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: StoreBackend> StoreClient<B> {
    /// Wraps a backend.
    #[must_use]
    pub fn new(backend: B, config: ClientConfig, metrics: Metrics) -> Self {
        let permits = Semaphore::new(config.max_in_flight.max(1));
        Self { inner: Arc::new(ClientInner { backend, config, permits, metrics }) }
    }

    /// The wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Client settings.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Shared metrics.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Free in-flight slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }

    async fn run<T, F, Fut>(&self, op: StoreOp, mut call: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let inner = &self.inner;
        let op_timeout = inner.config.op_timeout;
        with_retry(&inner.config.retry, Some(&inner.metrics), op.as_str(), || {
            let attempt = call();
            async move {
                // Held per attempt so callers in backoff do not occupy a slot.
                let _permit = inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| StorageError::internal("store client semaphore closed"))?;
                let start = Instant::now();
                let result = match tokio::time::timeout(op_timeout, attempt).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        inner.metrics.record_timeout();
                        Err(StorageError::timeout())
                    },
                };
                inner.metrics.record_op(op, start.elapsed());
                if result.is_err() {
                    inner.metrics.record_op_error(op);
                }
                result
            }
        })
        .await
    }

    /// Reads a key. Absent keys are `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] once retries are exhausted, or a
    /// non-transient backend error.
    #[tracing::instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.run(StoreOp::Get, || self.inner.backend.get(key)).await
    }

    /// Writes a key with an optional TTL.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    #[tracing::instrument(
        skip(self, value),
        fields(backend = self.inner.backend.name(), size = value.len())
    )]
    pub async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<std::time::Duration>,
    ) -> StorageResult<()> {
        self.run(StoreOp::Put, || self.inner.backend.put(key, value.clone(), ttl)).await
    }

    /// Deletes a key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    #[tracing::instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.run(StoreOp::Delete, || self.inner.backend.delete(key)).await
    }

    /// Sets an absolute expiry on a key. Returns `false` if it is absent.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    #[tracing::instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        self.run(StoreOp::ExpireAt, || self.inner.backend.expire_at(key, at)).await
    }

    /// Fetches one scan page. Each page is retried independently.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    #[tracing::instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn scan_page(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        self.run(StoreOp::Scan, || self.inner.backend.scan_prefix(prefix, cursor, limit)).await
    }

    /// Starts a lazy prefix scan paged at `scan_page_size`.
    #[must_use]
    pub fn scan_prefix(&self, prefix: impl Into<String>) -> PrefixScan<B> {
        PrefixScan {
            client: self.clone(),
            prefix: prefix.into(),
            cursor: None,
            done: false,
            page_size: self.inner.config.scan_page_size,
        }
    }

    /// Round-trips the store under the short health timeout, without retries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Timeout`] if the store does not answer in
    /// time, or the backend's error.
    #[tracing::instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn ping(&self) -> StorageResult<std::time::Duration> {
        let start = Instant::now();
        let result = match tokio::time::timeout(
            self.inner.config.health_timeout,
            self.inner.backend.health_check(HealthProbe::Liveness),
        )
        .await
        {
            Ok(Ok(status)) if status.is_unhealthy() => Err(StorageError::connection(
                status.reason().unwrap_or("backend reported unhealthy").to_owned(),
            )),
            Ok(Ok(_)) => Ok(start.elapsed()),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(StorageError::timeout()),
        };
        self.inner.metrics.record_op(StoreOp::Ping, start.elapsed());
        if result.is_err() {
            self.inner.metrics.record_op_error(StoreOp::Ping);
        }
        result
    }

    /// Probes the backend under the health timeout. Errors and timeouts are
    /// folded into an unhealthy status.
    #[tracing::instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn health_check(&self, probe: HealthProbe) -> HealthStatus {
        let start = Instant::now();
        let outcome =
            tokio::time::timeout(self.inner.config.health_timeout, self.inner.backend.health_check(probe))
                .await;
        self.inner.metrics.record_op(StoreOp::Ping, start.elapsed());
        let metadata = || HealthMetadata::new(start.elapsed(), self.inner.backend.name());
        match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                self.inner.metrics.record_op_error(StoreOp::Ping);
                tracing::warn!(error = %err, %probe, "backing store health check failed");
                HealthStatus::unhealthy(metadata(), err.to_string())
            },
            Err(_elapsed) => {
                self.inner.metrics.record_op_error(StoreOp::Ping);
                tracing::warn!(%probe, "backing store health check timed out");
                HealthStatus::unhealthy(metadata(), "health check timed out")
            },
        }
    }
}

/// Lazy pager over a key prefix.
///
/// Each [`next_page`](Self::next_page) issues one retried scan call. Pages
/// may be short or empty while the scan continues.
pub struct PrefixScan<B> {
    client: StoreClient<B>,
    prefix: String,
    cursor: Option<String>,
    done: bool,
    page_size: usize,
}

impl<B: StoreBackend> PrefixScan<B> {
    /// Overrides the page size.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fetches the next page, or `None` once the scan is complete.
    ///
    /// # Errors
    ///
    /// Returns the client's error for the failed page. The scan can be
    /// resumed by calling again.
    pub async fn next_page(&mut self) -> StorageResult<Option<Vec<KeyValue>>> {
        if self.done {
            return Ok(None);
        }
        let page =
            self.client.scan_page(&self.prefix, self.cursor.as_deref(), self.page_size).await?;
        match page.next_cursor {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.done = true,
        }
        Ok(Some(page.entries))
    }

    /// Drains the scan into one vector.
    ///
    /// # Errors
    ///
    /// Returns the first page error.
    pub async fn collect_all(mut self) -> StorageResult<Vec<KeyValue>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
