//! Storage engine for TinyOlly telemetry.
//!
//! This crate persists spans, logs and metric samples in a remote key-value
//! store, maintains the secondary indexes that make them queryable, enforces
//! per-kind retention windows and capacity ceilings, and fronts the query
//! paths with a single-flight read-through cache. The ingestion and query
//! services both go through [`TelemetryStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Ingestion service  │  Query service            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     TelemetryStore                          │
//! │   ingest · get_trace · query_* · list_traces · service map  │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │  QueryCache  │ IndexManager │  Retention   │     Codec      │
//! ├──────────────┴──────────────┴──────────────┴────────────────┤
//! │          StoreClient (timeouts, retries, in-flight cap)     │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│ RedisBackend (tinyolly-common-storage-redis)  │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use tinyolly_common_storage::{
//!     MemoryBackend, StorageConfig, TelemetryStore, Timestamp, model::Span,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = TelemetryStore::new(MemoryBackend::new(), StorageConfig::default())?;
//!
//!     let span = Span {
//!         trace_id: "4bf92f3577b34da6".into(),
//!         span_id: "00f067aa0ba902b7".into(),
//!         parent_span_id: None,
//!         service_name: "frontend".into(),
//!         operation_name: "GET /cart".into(),
//!         start_time: Timestamp::now().saturating_sub(Duration::from_secs(2)),
//!         duration_nanos: 1_500_000,
//!         status: Default::default(),
//!         status_message: None,
//!         kind: Default::default(),
//!         attributes: Default::default(),
//!         events: Vec::new(),
//!     };
//!     store.ingest(span.into()).await?;
//!
//!     let trace = store.get_trace("4bf92f3577b34da6").await?.expect("trace stored");
//!     assert_eq!(trace.root().service_name, "frontend");
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StoreBackend`] trait
//! 2. Map backend-specific errors to [`StorageError`], marking transient ones as
//!    [`StorageError::Connection`] or [`StorageError::Timeout`] so the client retries them
//! 3. Run the [`conformance`] suite against it
//!
//! See the [`memory`] module source for a reference implementation.
//!
//! # Error Handling
//!
//! Backend and client operations return [`StorageResult<T>`]. The facade
//! returns [`TelemetryResult<T>`], whose [`TelemetryError`] separates caller
//! mistakes (`InvalidRecord`, `InvalidQuery`) from store outages
//! (`StoreUnavailable`) and partially indexed writes (`IndexInconsistent`).
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` and `conformance` modules (record builders,
//!   fault-injecting backend, assertion macros, backend contract checks).
//! - **`failpoints`**: Compiles the `fail_point!` injection sites.

#![deny(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod conformance;
pub mod error;
pub mod health;
pub mod index;
pub mod keys;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod retention;
pub mod retry;
pub mod size_limits;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

// Re-export primary types at crate root for convenience
pub use backend::{KeyValue, ScanPage, StoreBackend};
pub use cache::{CacheConfig, Fingerprint, QueryCache};
pub use client::StoreClient;
pub use codec::{Codec, CodecError};
pub use config::{
    ClientConfig, CodecConfig, IndexConfig, IngestConfig, QueryConfig, RetentionConfig,
    RetryConfig, StorageConfig,
};
pub use error::{
    BoxError, ConfigError, StorageError, StorageResult, TelemetryError, TelemetryResult,
};
pub use health::{HealthMetadata, HealthProbe, HealthStatus};
pub use index::{Dimension, IndexManager};
pub use memory::MemoryBackend;
pub use metrics::{LatencyPercentiles, Metrics, MetricsSnapshot};
pub use model::{RecordKind, TelemetryRecord, TimeRange, Timestamp};
pub use retention::{EvictionReport, RetentionManager, SweepReport};
pub use size_limits::{SizeLimits, validate_sizes};
pub use store::{
    IngestReport, LogQuery, MaintenanceHandle, MetricQuery, Page, ReconcileReport, SpanQuery,
    StoreStats, TelemetryStore, TraceQuery,
};
