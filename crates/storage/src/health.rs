//! Health reporting for backends and the storage facade.
//!
//! [`StoreBackend::health_check`](crate::StoreBackend::health_check) and
//! [`TelemetryStore::health_check`](crate::TelemetryStore::health_check) both
//! return a [`HealthStatus`]. The facade folds the backend result together
//! with its own state, so a reachable store with records awaiting index
//! reconciliation reports `Degraded` rather than `Healthy`.
//!
//! | `HealthProbe` | `HealthStatus` | Serve traffic? |
//! |---------------|----------------|----------------|
//! | `Liveness`    | any            | process alive  |
//! | `Readiness`   | `Healthy`      | yes            |
//! | `Readiness`   | `Degraded`     | yes, queries may miss recent records |
//! | `Readiness`   | `Unhealthy`    | no             |
//! | `Startup`     | `Healthy`      | first connection made |

use std::{collections::BTreeMap, fmt, time::Duration};

/// The kind of health probe to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthProbe {
    /// The process is alive. Backends answer without touching the network.
    Liveness,
    /// The store is reachable and indexes are consistent.
    Readiness,
    /// The first round trip to the store succeeded.
    Startup,
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Liveness => "liveness",
            Self::Readiness => "readiness",
            Self::Startup => "startup",
        })
    }
}

/// Outcome of a health probe.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy(HealthMetadata),
    /// Serving, with the reason for reduced capability.
    Degraded(HealthMetadata, String),
    /// Not serving, with the failure reason.
    Unhealthy(HealthMetadata, String),
}

impl HealthStatus {
    /// Creates a `Healthy` status.
    #[must_use]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status.
    #[must_use]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unhealthy` status.
    #[must_use]
    pub fn unhealthy(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unhealthy(metadata, reason.into())
    }

    /// Returns `true` if fully healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Returns `true` if degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(..))
    }

    /// Returns `true` if unhealthy.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(..))
    }

    /// Returns `true` unless unhealthy.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        !self.is_unhealthy()
    }

    /// Metadata attached to the status.
    #[must_use]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unhealthy(m, _) => m,
        }
    }

    /// Degradation or failure reason.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy(_) => None,
            Self::Degraded(_, reason) | Self::Unhealthy(_, reason) => Some(reason),
        }
    }

    /// Downgrades a healthy status to degraded. Worse states are kept.
    #[must_use]
    pub fn degrade(self, reason: impl Into<String>) -> Self {
        match self {
            Self::Healthy(m) => Self::Degraded(m, reason.into()),
            other => other,
        }
    }

    /// Mutable access to the metadata, for adding details.
    pub fn metadata_mut(&mut self) -> &mut HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unhealthy(m, _) => m,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.metadata().check_duration.as_millis();
        match self {
            Self::Healthy(_) => write!(f, "healthy ({millis}ms)"),
            Self::Degraded(_, reason) => write!(f, "degraded: {reason} ({millis}ms)"),
            Self::Unhealthy(_, reason) => write!(f, "unhealthy: {reason} ({millis}ms)"),
        }
    }
}

/// Timing and backend details attached to a [`HealthStatus`].
#[derive(Debug, Clone)]
pub struct HealthMetadata {
    /// How long the check took.
    pub check_duration: Duration,
    /// Backend identifier, such as `"memory"` or `"redis"`.
    pub backend: String,
    /// Free-form details (`entry_count`, `pending_index`, `pool_size`, ...).
    pub details: BTreeMap<String, String>,
}

impl HealthMetadata {
    /// Creates metadata with no details.
    #[must_use]
    pub fn new(check_duration: Duration, backend: impl Into<String>) -> Self {
        Self { check_duration, backend: backend.into(), details: BTreeMap::new() }
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn meta() -> HealthMetadata {
        HealthMetadata::new(Duration::from_millis(5), "memory")
    }

    #[test]
    fn test_predicates() {
        let status = HealthStatus::healthy(meta());
        assert!(status.is_healthy() && status.is_serving());
        assert!(status.reason().is_none());

        let status = HealthStatus::degraded(meta(), "3 records pending reindex");
        assert!(status.is_degraded() && status.is_serving());
        assert_eq!(status.reason(), Some("3 records pending reindex"));

        let status = HealthStatus::unhealthy(meta(), "connection refused");
        assert!(status.is_unhealthy() && !status.is_serving());
    }

    #[test]
    fn test_degrade_keeps_worse_state() {
        let degraded = HealthStatus::healthy(meta()).degrade("pending");
        assert!(degraded.is_degraded());

        let unhealthy = HealthStatus::unhealthy(meta(), "down").degrade("pending");
        assert_eq!(unhealthy.reason(), Some("down"));
    }

    #[test]
    fn test_details() {
        let meta = meta().with_detail("entry_count", 42).with_detail("backend_ms", "1");
        assert_eq!(meta.details.get("entry_count").map(String::as_str), Some("42"));
        assert_eq!(meta.details.len(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(HealthStatus::healthy(meta()).to_string(), "healthy (5ms)");
        assert_eq!(
            HealthStatus::unhealthy(HealthMetadata::new(Duration::from_secs(1), "redis"), "timeout")
                .to_string(),
            "unhealthy: timeout (1000ms)"
        );
        assert_eq!(HealthProbe::Readiness.to_string(), "readiness");
    }
}
