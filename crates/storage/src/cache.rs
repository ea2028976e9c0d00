//! Read-through query cache.
//!
//! [`QueryCache`] memoizes decoded query results keyed by a [`Fingerprint`].
//! It is owned by one [`TelemetryStore`](crate::TelemetryStore) and never
//! shared globally.
//!
//! - **Bounded**: by entry count, or by summed [`Cacheable::size_estimate`]
//!   when `max_bytes` is set. Eviction is strict LRU.
//! - **Single-flight**: concurrent misses on one fingerprint run the compute
//!   once. A failed compute is handed to every waiter and not cached.
//! - **Expiry-aware**: an entry lives for `min(ttl, time until
//!   Cacheable::expires_at)`, so a cached result never outlives the records
//!   it was computed from.
//! - **Generation-checked**: every invalidation bumps a generation counter
//!   and records it against the scope it touched (one fingerprint, one
//!   namespace or everything). An entry computed at an older generation than
//!   any mark over its fingerprint is a miss on read. A compute that started
//!   before an invalidation still answers the callers that started it, but
//!   its result is dropped from the cache afterwards.
//!
//! Writers and the retention sweep invalidate through the
//! [`InvalidationSink`] trait, usually with an [`InvalidationPlan`].

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    future::Future,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::{Expiry, future::Cache, policy::EvictionPolicy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    error::ConfigError,
    metrics::Metrics,
    model::{RecordKind, Timestamp},
};

// ───────────────────────────────────────────────────────────────────────────
// CacheConfig
// ───────────────────────────────────────────────────────────────────────────

const DEFAULT_MAX_ENTRIES: u64 = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(60);
const MIN_TTL: Duration = Duration::from_millis(1);

/// Configuration for the read-through cache.
///
/// - `max_entries` must be at least 1
/// - `max_bytes`, when set, must be at least 1 and replaces the entry bound
/// - `ttl` must be at least 1 ms
///
/// ```
/// # use std::time::Duration;
/// # use tinyolly_common_storage::CacheConfig;
/// let config = CacheConfig::builder()
///     .max_entries(5_000)
///     .ttl(Duration::from_secs(120))
///     .build()
///     .expect("valid config");
/// assert!(config.enabled());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCacheConfig", into = "RawCacheConfig")]
pub struct CacheConfig {
    max_entries: u64,
    max_bytes: Option<u64>,
    ttl: Duration,
    enabled: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCacheConfig {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_max_entries")]
    max_entries: u64,
    #[serde(default)]
    max_bytes: Option<u64>,
    #[serde(with = "humantime_serde", default = "default_ttl")]
    ttl: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_max_entries() -> u64 {
    DEFAULT_MAX_ENTRIES
}

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

impl TryFrom<RawCacheConfig> for CacheConfig {
    type Error = ConfigError;

    fn try_from(raw: RawCacheConfig) -> Result<Self, Self::Error> {
        if !raw.enabled {
            return Ok(Self::disabled());
        }
        let mut builder = Self::builder().max_entries(raw.max_entries).ttl(raw.ttl);
        if let Some(max_bytes) = raw.max_bytes {
            builder = builder.max_bytes(max_bytes);
        }
        builder.build()
    }
}

impl From<CacheConfig> for RawCacheConfig {
    fn from(config: CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            ttl: config.ttl,
        }
    }
}

impl CacheConfig {
    /// Starts a builder with the defaults (10 000 entries, 60 s).
    #[must_use]
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder { max_entries: DEFAULT_MAX_ENTRIES, max_bytes: None, ttl: DEFAULT_TTL }
    }

    /// A configuration that turns caching off. Every lookup computes.
    #[must_use]
    pub fn disabled() -> Self {
        Self { max_entries: 0, max_bytes: None, ttl: Duration::ZERO, enabled: false }
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Maximum summed size estimate, if bounded by bytes.
    #[must_use]
    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    /// Upper bound on entry lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether caching is on.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Re-checks field constraints.
    ///
    /// # Errors
    ///
    /// See [`CacheConfigBuilder::build`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        let mut builder = Self::builder().max_entries(self.max_entries).ttl(self.ttl);
        if let Some(max_bytes) = self.max_bytes {
            builder = builder.max_bytes(max_bytes);
        }
        builder.build().map(|_| ())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: DEFAULT_MAX_ENTRIES, max_bytes: None, ttl: DEFAULT_TTL, enabled: true }
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug)]
pub struct CacheConfigBuilder {
    max_entries: u64,
    max_bytes: Option<u64>,
    ttl: Duration,
}

impl CacheConfigBuilder {
    /// Sets the entry bound.
    #[must_use]
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Bounds the cache by summed size estimate instead of entry count.
    #[must_use]
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Sets the entry lifetime bound.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `max_entries` or `max_bytes`
    /// is 0, or `ttl` is under 1 ms.
    pub fn build(self) -> Result<CacheConfig, ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_entries",
                value: self.max_entries.to_string(),
                min: "1".to_owned(),
            });
        }
        if self.max_bytes == Some(0) {
            return Err(ConfigError::BelowMinimum {
                field: "max_bytes",
                value: "0".to_owned(),
                min: "1".to_owned(),
            });
        }
        if self.ttl < MIN_TTL {
            return Err(ConfigError::BelowMinimum {
                field: "ttl",
                value: format!("{}us", self.ttl.as_micros()),
                min: "1ms".to_owned(),
            });
        }
        Ok(CacheConfig {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            ttl: self.ttl,
            enabled: true,
        })
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Fingerprint
// ───────────────────────────────────────────────────────────────────────────

/// Fingerprint namespaces used by the facade.
pub mod namespace {
    /// A single assembled trace, keyed by trace id.
    pub const TRACE: &str = "trace";
    /// Span queries.
    pub const SPANS: &str = "spans";
    /// Trace list queries.
    pub const TRACES: &str = "traces";
    /// Log queries.
    pub const LOGS: &str = "logs";
    /// Metric queries.
    pub const METRICS: &str = "metrics";
    /// Service maps.
    pub const SERVICE_MAP: &str = "service_map";
    /// The service catalog.
    pub const SERVICES: &str = "services";
    /// The metric catalog.
    pub const METRIC_CATALOG: &str = "metric_catalog";
}

/// Cache key: a namespace plus either a literal id or a query hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// `{namespace}:{id}`.
    #[must_use]
    pub fn new(namespace: &str, id: &str) -> Self {
        Self(format!("{namespace}:{id}").into())
    }

    /// `{namespace}:{xxh3(query)}`. Equal queries map to equal fingerprints.
    #[must_use]
    pub fn from_query(namespace: &str, query: &impl Hash) -> Self {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        query.hash(&mut hasher);
        Self(format!("{namespace}:{:016x}", hasher.finish()).into())
    }

    /// Fingerprint of an assembled trace.
    #[must_use]
    pub fn trace(trace_id: &str) -> Self {
        Self::new(namespace::TRACE, trace_id)
    }

    /// The full key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace part of the key.
    #[must_use]
    pub fn namespace(&self) -> &str {
        let key: &str = &self.0;
        key.split_once(':').map_or(key, |(namespace, _)| namespace)
    }

    /// Returns `true` if the key lies in `namespace`.
    #[must_use]
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.0.strip_prefix(namespace).is_some_and(|rest| rest.starts_with(':'))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────────────

/// A value the cache can hold.
pub trait Cacheable: Clone + Send + Sync + 'static {
    /// Approximate heap footprint in bytes, used by the byte bound.
    fn size_estimate(&self) -> usize;

    /// Earliest instant at which any record behind the value expires.
    fn expires_at(&self) -> Option<Timestamp> {
        None
    }
}

/// A cached value with its bookkeeping.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the entry was computed.
    pub inserted_at: Instant,
    /// Size estimate at insertion.
    pub size_estimate: usize,
    /// Earliest backing expiry.
    pub expires_at: Option<Timestamp>,
    /// Invalidation generation the compute started in.
    pub generation: u64,
}

struct EntryExpiry {
    ttl: Duration,
}

impl<V> Expiry<Fingerprint, Arc<CacheEntry<V>>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        entry: &Arc<CacheEntry<V>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        let remaining = entry
            .expires_at
            .map_or(self.ttl, |at| self.ttl.min(at.duration_since(Timestamp::now())));
        Some(remaining)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// QueryCache
// ───────────────────────────────────────────────────────────────────────────

/// Joined computes that turned out stale are retried this many times before
/// their value is returned anyway.
const MAX_STALE_JOINS: usize = 2;

/// Generation of the latest invalidation over each scope.
struct InvalidationMarks {
    all: AtomicU64,
    namespaces: Mutex<HashMap<String, u64>>,
    // Same TTL and bound as the entries.
    fingerprints: Cache<Fingerprint, u64>,
}

impl InvalidationMarks {
    fn new(config: &CacheConfig) -> Self {
        Self {
            all: AtomicU64::new(0),
            namespaces: Mutex::new(HashMap::new()),
            fingerprints: Cache::builder().max_capacity(config.max_entries).time_to_live(config.ttl).build(),
        }
    }

    async fn is_current(&self, fingerprint: &Fingerprint, computed_at: u64) -> bool {
        if self.all.load(Ordering::Acquire) > computed_at {
            return false;
        }
        let namespace_mark = self.namespaces.lock().get(fingerprint.namespace()).copied();
        if namespace_mark.is_some_and(|mark| mark > computed_at) {
            return false;
        }
        self.fingerprints.get(fingerprint).await.is_none_or(|mark| mark <= computed_at)
    }
}

/// Bounded, single-flight read-through cache.
pub struct QueryCache<V: Cacheable> {
    cache: Option<Cache<Fingerprint, Arc<CacheEntry<V>>>>,
    marks: Option<InvalidationMarks>,
    generation: AtomicU64,
    config: CacheConfig,
    metrics: Metrics,
}

impl<V: Cacheable> QueryCache<V> {
    /// Creates a cache. A disabled config allocates nothing.
    #[must_use]
    pub fn new(config: CacheConfig, metrics: Metrics) -> Self {
        let cache = config.enabled.then(|| {
            let builder = Cache::builder()
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(EntryExpiry { ttl: config.ttl })
                .support_invalidation_closures();
            match config.max_bytes {
                Some(max_bytes) => builder
                    .max_capacity(max_bytes)
                    .weigher(|_key: &Fingerprint, entry: &Arc<CacheEntry<V>>| {
                        u32::try_from(entry.size_estimate).unwrap_or(u32::MAX)
                    })
                    .build(),
                None => builder.max_capacity(config.max_entries).build(),
            }
        });
        let marks = config.enabled.then(|| InvalidationMarks::new(&config));
        Self { cache, marks, generation: AtomicU64::new(0), config, metrics }
    }

    /// Cache settings.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current invalidation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the cached value, if present, live and computed after the
    /// latest invalidation over its fingerprint.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<V> {
        let cache = self.cache.as_ref()?;
        let entry = cache.get(fingerprint).await?;
        if self.is_current(fingerprint, &entry).await {
            return Some(entry.value.clone());
        }
        trace!(%fingerprint, "dropping entry computed before an invalidation");
        cache.invalidate(fingerprint).await;
        None
    }

    /// Returns the cached value or computes it once for all concurrent
    /// callers.
    ///
    /// `compute` runs at most once per call unless the caller joined a
    /// compute that an invalidation has since made stale.
    ///
    /// # Errors
    ///
    /// Returns the compute error, shared with every caller that waited on
    /// the same fingerprint.
    pub async fn get_or_compute<E, F, Fut>(&self, fingerprint: Fingerprint, mut compute: F) -> Result<V, E>
    where
        E: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let Some(cache) = self.cache.as_ref() else {
            self.metrics.record_cache_miss();
            return compute().await;
        };

        let mut stale_joins = 0;
        loop {
            if let Some(value) = self.get(&fingerprint).await {
                self.metrics.record_cache_hit();
                return Ok(value);
            }

            let generation = self.generation();
            let attempt = compute();
            let init = async move {
                let value = attempt.await?;
                let size_estimate = value.size_estimate();
                let expires_at = value.expires_at();
                Ok::<_, E>(Arc::new(CacheEntry {
                    value,
                    inserted_at: Instant::now(),
                    size_estimate,
                    expires_at,
                    generation,
                }))
            };

            let entry = cache
                .entry(fingerprint.clone())
                .or_try_insert_with(init)
                .await
                .map_err(|err: Arc<E>| Arc::unwrap_or_clone(err))?;

            if entry.is_fresh() {
                self.metrics.record_cache_miss();
                if entry.value().generation != self.generation() {
                    // An invalidation ran while computing; the result may predate it.
                    trace!(%fingerprint, "dropping result computed across an invalidation");
                    cache.invalidate(&fingerprint).await;
                }
                return Ok(entry.into_value().value.clone());
            }

            // Joined another caller's compute.
            let stored = entry.into_value();
            if stale_joins == MAX_STALE_JOINS || self.is_current(&fingerprint, &stored).await {
                self.metrics.record_cache_hit();
                return Ok(stored.value.clone());
            }
            stale_joins += 1;
            trace!(%fingerprint, "joined a compute that predates an invalidation");
            cache.invalidate(&fingerprint).await;
        }
    }

    /// Removes one entry.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) {
        let mark = self.bump();
        if let Some(marks) = &self.marks {
            marks.fingerprints.insert(fingerprint.clone(), mark).await;
        }
        if let Some(cache) = &self.cache {
            cache.invalidate(fingerprint).await;
        }
    }

    /// Removes every entry in a namespace.
    pub fn invalidate_namespace(&self, namespace: &str) {
        let mark = self.bump();
        if let Some(marks) = &self.marks {
            let mut namespaces = marks.namespaces.lock();
            let latest = namespaces.entry(namespace.to_owned()).or_default();
            *latest = (*latest).max(mark);
        }
        let Some(cache) = &self.cache else { return };
        let namespace = namespace.to_owned();
        if let Err(err) = cache.invalidate_entries_if(move |key, _| key.in_namespace(&namespace)) {
            debug!(error = %err, "predicate invalidation unavailable, clearing cache");
            cache.invalidate_all();
        }
    }

    /// Removes every entry.
    pub fn invalidate_all(&self) {
        let mark = self.bump();
        if let Some(marks) = &self.marks {
            marks.all.fetch_max(mark, Ordering::AcqRel);
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    /// Approximate number of live entries.
    pub async fn entry_count(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            },
            None => 0,
        }
    }

    /// Advances the generation and returns the new value.
    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn is_current(&self, fingerprint: &Fingerprint, entry: &CacheEntry<V>) -> bool {
        match &self.marks {
            Some(marks) => marks.is_current(fingerprint, entry.generation).await,
            None => true,
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Invalidation
// ───────────────────────────────────────────────────────────────────────────

/// Receiver of cache invalidations from writers and the retention sweep.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    /// Drops one fingerprint.
    async fn invalidate(&self, fingerprint: &Fingerprint);

    /// Drops every fingerprint in a namespace.
    async fn invalidate_namespace(&self, namespace: &str);

    /// Drops everything.
    async fn invalidate_all(&self);
}

#[async_trait]
impl<V: Cacheable> InvalidationSink for QueryCache<V> {
    async fn invalidate(&self, fingerprint: &Fingerprint) {
        QueryCache::invalidate(self, fingerprint).await;
    }

    async fn invalidate_namespace(&self, namespace: &str) {
        QueryCache::invalidate_namespace(self, namespace);
    }

    async fn invalidate_all(&self) {
        QueryCache::invalidate_all(self);
    }
}

/// A sink that drops every invalidation, for callers without a cache.
#[async_trait]
impl InvalidationSink for () {
    async fn invalidate(&self, _fingerprint: &Fingerprint) {}

    async fn invalidate_namespace(&self, _namespace: &str) {}

    async fn invalidate_all(&self) {}
}

/// The set of cache entries a batch of record changes makes stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Kinds of records added or removed.
    pub kinds: BTreeSet<RecordKind>,
    /// Traces whose span set changed.
    pub traces: BTreeSet<String>,
}

impl InvalidationPlan {
    /// Notes a changed record.
    pub fn add(&mut self, kind: RecordKind, trace_id: Option<&str>) {
        self.kinds.insert(kind);
        if kind == RecordKind::Span
            && let Some(trace_id) = trace_id
        {
            self.traces.insert(trace_id.to_owned());
        }
    }

    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Namespaces made stale by the changed kinds.
    #[must_use]
    pub fn namespaces(&self) -> BTreeSet<&'static str> {
        let mut out = BTreeSet::new();
        for kind in &self.kinds {
            out.insert(namespace::SERVICES);
            match kind {
                RecordKind::Span => {
                    out.extend([namespace::SPANS, namespace::TRACES, namespace::SERVICE_MAP]);
                },
                RecordKind::Log => {
                    out.insert(namespace::LOGS);
                },
                RecordKind::Metric => {
                    out.extend([namespace::METRICS, namespace::METRIC_CATALOG]);
                },
            }
        }
        out
    }

    /// Sends the invalidations to `sink`.
    pub async fn apply(&self, sink: &dyn InvalidationSink) {
        for trace_id in &self.traces {
            sink.invalidate(&Fingerprint::trace(trace_id)).await;
        }
        for namespace in self.namespaces() {
            sink.invalidate_namespace(namespace).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Value {
        body: String,
        expires_at: Option<Timestamp>,
    }

    impl Value {
        fn new(body: &str) -> Self {
            Self { body: body.into(), expires_at: None }
        }
    }

    impl Cacheable for Value {
        fn size_estimate(&self) -> usize {
            self.body.len()
        }

        fn expires_at(&self) -> Option<Timestamp> {
            self.expires_at
        }
    }

    fn cache() -> QueryCache<Value> {
        QueryCache::new(CacheConfig::default(), Metrics::new())
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::builder().max_entries(0).build().is_err());
        assert!(CacheConfig::builder().max_bytes(0).build().is_err());
        assert!(CacheConfig::builder().ttl(Duration::ZERO).build().is_err());
        assert!(CacheConfig::disabled().validate().is_ok());
        assert_eq!(CacheConfig::builder().build().unwrap(), CacheConfig::default());
    }

    #[test]
    fn test_config_deserialize() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"max_entries": 50, "ttl": "5s"}"#).unwrap();
        assert_eq!(config.max_entries(), 50);
        assert_eq!(config.ttl(), Duration::from_secs(5));

        let config: CacheConfig = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert!(!config.enabled());
        assert!(serde_json::from_str::<CacheConfig>(r#"{"max_entries": 0}"#).is_err());
    }

    #[test]
    fn test_fingerprints() {
        let a = Fingerprint::from_query(namespace::LOGS, &("api", 10u64));
        let b = Fingerprint::from_query(namespace::LOGS, &("api", 10u64));
        let c = Fingerprint::from_query(namespace::LOGS, &("api", 11u64));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.in_namespace("logs"));
        assert!(!a.in_namespace("log"));
        assert_eq!(a.namespace(), "logs");
        assert_eq!(Fingerprint::trace("t1").as_str(), "trace:t1");
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let cache = cache();
        let fp = Fingerprint::new("logs", "q1");
        let v = cache.get_or_compute(fp.clone(), || async { Ok::<_, String>(Value::new("a")) }).await;
        assert_eq!(v.unwrap().body, "a");
        let v = cache.get_or_compute(fp.clone(), || async { Ok::<_, String>(Value::new("b")) }).await;
        assert_eq!(v.unwrap().body, "a");

        let s = cache.metrics.snapshot();
        assert_eq!((s.cache_hits, s.cache_misses), (1, 1));
        assert_eq!(cache.get(&fp).await.unwrap().body, "a");
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = cache();
        let fp = Fingerprint::new("logs", "q1");
        let err = cache.get_or_compute(fp.clone(), || async { Err::<Value, _>("boom".to_owned()) }).await;
        assert_eq!(err.unwrap_err(), "boom");
        let ok = cache.get_or_compute(fp, || async { Ok::<_, String>(Value::new("ok")) }).await;
        assert_eq!(ok.unwrap().body, "ok");
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = Arc::new(cache());
        let computes = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            tasks.spawn(async move {
                cache
                    .get_or_compute(Fingerprint::new("trace", "t1"), || async {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(Value::new("trace"))
                    })
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().body, "trace");
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_namespace_leaves_others() {
        let cache = cache();
        for (ns, id) in [("logs", "a"), ("logs", "b"), ("metrics", "a")] {
            cache
                .get_or_compute(Fingerprint::new(ns, id), || async { Ok::<_, String>(Value::new(id)) })
                .await
                .unwrap();
        }
        cache.invalidate_namespace("logs");
        assert!(cache.get(&Fingerprint::new("logs", "a")).await.is_none());
        assert!(cache.get(&Fingerprint::new("logs", "b")).await.is_none());
        assert!(cache.get(&Fingerprint::new("metrics", "a")).await.is_some());

        cache.invalidate_all();
        assert!(cache.get(&Fingerprint::new("metrics", "a")).await.is_none());
    }

    #[tokio::test]
    async fn test_compute_straddling_invalidation_is_not_kept() {
        let cache = Arc::new(cache());
        let fp = Fingerprint::new("logs", "q");
        let inner = Arc::clone(&cache);
        let v = cache
            .get_or_compute(fp.clone(), || async {
                inner.invalidate_namespace("logs");
                Ok::<_, String>(Value::new("stale"))
            })
            .await
            .unwrap();
        assert_eq!(v.body, "stale");
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn test_entry_older_than_an_invalidation_is_a_miss() {
        let cache = cache();
        let logs = Fingerprint::new("logs", "q");
        let trace = Fingerprint::trace("t1");
        let metrics = Fingerprint::new("metrics", "q");
        let computed_at = cache.generation();
        cache.invalidate_namespace("logs");
        cache.invalidate(&trace).await;

        // Results of computes that straddled those invalidations, landing
        // before their own cleanup runs.
        let store = cache.cache.as_ref().unwrap();
        for fp in [&logs, &trace, &metrics] {
            let entry = CacheEntry {
                value: Value::new("stale"),
                inserted_at: Instant::now(),
                size_estimate: 5,
                expires_at: None,
                generation: computed_at,
            };
            store.insert(fp.clone(), Arc::new(entry)).await;
        }

        assert!(cache.get(&logs).await.is_none());
        assert!(cache.get(&trace).await.is_none());
        assert_eq!(cache.get(&metrics).await.unwrap().body, "stale");

        let v = cache.get_or_compute(logs.clone(), || async { Ok::<_, String>(Value::new("fresh")) }).await;
        assert_eq!(v.unwrap().body, "fresh");
        assert_eq!(cache.get(&logs).await.unwrap().body, "fresh");
    }

    #[tokio::test]
    async fn test_joined_compute_straddling_invalidation_is_recomputed() {
        let cache = Arc::new(cache());
        let fp = Fingerprint::new("logs", "q");
        let computes = Arc::new(AtomicUsize::new(0));
        let compute = {
            let computes = Arc::clone(&computes);
            move || {
                let computes = Arc::clone(&computes);
                async move {
                    let n = computes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok::<_, String>(Value::new(&format!("v{n}")))
                }
            }
        };

        let first = tokio::spawn({
            let (cache, fp, compute) = (Arc::clone(&cache), fp.clone(), compute.clone());
            async move { cache.get_or_compute(fp, compute).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_namespace("logs");
        let joined = cache.get_or_compute(fp.clone(), compute).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap().body, "v0");
        assert_eq!(joined.body, "v1");
        assert_eq!(computes.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&fp).await.unwrap().body, "v1");
    }

    #[tokio::test]
    async fn test_entry_never_outlives_backing_expiry() {
        let cache = cache();
        let fp = Fingerprint::new("trace", "t1");
        let value = Value {
            body: "x".into(),
            expires_at: Some(Timestamp::now().saturating_add(Duration::from_millis(30))),
        };
        cache.get_or_compute(fp.clone(), || async { Ok::<_, String>(value.clone()) }).await.unwrap();
        assert!(cache.get(&fp).await.is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_always_computes() {
        let cache: QueryCache<Value> = QueryCache::new(CacheConfig::disabled(), Metrics::new());
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_compute(Fingerprint::new("logs", "q"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Value::new("v"))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_byte_bound_evicts() {
        let config = CacheConfig::builder().max_bytes(100).build().unwrap();
        let cache: QueryCache<Value> = QueryCache::new(config, Metrics::new());
        for i in 0..10 {
            let body = "x".repeat(40);
            cache
                .get_or_compute(Fingerprint::new("logs", &i.to_string()), || async {
                    Ok::<_, String>(Value::new(&body))
                })
                .await
                .unwrap();
        }
        assert!(cache.entry_count().await <= 2);
    }

    #[tokio::test]
    async fn test_plan_namespaces_and_apply() {
        let mut plan = InvalidationPlan::default();
        assert!(plan.is_empty());
        plan.add(RecordKind::Span, Some("t1"));
        plan.add(RecordKind::Log, Some("t2"));
        assert_eq!(plan.traces.len(), 1);
        let namespaces = plan.namespaces();
        assert!(namespaces.contains(namespace::SERVICE_MAP));
        assert!(namespaces.contains(namespace::LOGS));
        assert!(!namespaces.contains(namespace::METRICS));

        let cache = cache();
        let fp = Fingerprint::trace("t1");
        cache.get_or_compute(fp.clone(), || async { Ok::<_, String>(Value::new("t")) }).await.unwrap();
        plan.apply(&cache).await;
        assert!(cache.get(&fp).await.is_none());
    }
}
