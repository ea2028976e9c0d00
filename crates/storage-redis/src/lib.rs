//! Redis-compatible backing store for the TinyOlly storage engine.
//!
//! [`RedisBackend`] implements [`StoreBackend`](tinyolly_common_storage::StoreBackend)
//! over a `deadpool-redis` connection pool. It works against Redis and
//! Valkey servers.
//!
//! ```no_run
//! use tinyolly_common_storage::{StorageConfig, TelemetryStore};
//! use tinyolly_common_storage_redis::{RedisBackend, RedisBackendConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisBackendConfig::builder()
//!     .url("redis://localhost:6379/0")
//!     .key_prefix("tinyolly")
//!     .build()?;
//! let backend = RedisBackend::connect(config).await?;
//! let store = TelemetryStore::new(backend, StorageConfig::default())?;
//! let services = store.list_services().await?;
//! # let _ = services;
//! # Ok(())
//! # }
//! ```
//!
//! Transient failures (dropped connections, pool timeouts, a server still
//! loading its dataset) surface as retryable
//! [`StorageError`](tinyolly_common_storage::StorageError)s so the store
//! client retries them.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;

pub use backend::RedisBackend;
pub use config::RedisBackendConfig;
pub use error::{RedisStorageError, Result};
