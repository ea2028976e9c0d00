//! Retry with exponential backoff for transient store failures.
//!
//! [`with_retry`] re-runs an operation while it fails with a transient
//! [`StorageError`] (connection failures, attempt timeouts). Other errors are
//! returned immediately. Once the budget of `max_retries + 1` attempts is
//! spent, the last transient error is folded into
//! [`StorageError::Unavailable`].
//!
//! The delay before retry `n` (zero-based) is
//! `min(initial_backoff * 2^n, max_backoff)` plus 0–50% random jitter.

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{StorageError, StorageResult},
    metrics::Metrics,
};

/// Runs `operation` until it succeeds, fails permanently, or the retry
/// budget is exhausted.
///
/// # Errors
///
/// Returns the first non-transient error unchanged, or
/// [`StorageError::Unavailable`] after `max_retries + 1` transient failures.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    metrics: Option<&Metrics>,
    operation_name: &'static str,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                if let Some(m) = metrics {
                    m.record_retry();
                }
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) if err.is_transient() => {
                if let Some(m) = metrics {
                    m.record_retry_exhausted();
                }
                tracing::warn!(
                    operation = operation_name,
                    attempts,
                    error = %err,
                    "retry budget exhausted",
                );
                return Err(StorageError::unavailable(attempts, err.detail()));
            },
            Err(err) => return Err(err),
        }
    }
}

/// Backoff before the retry following zero-based `attempt`.
pub(crate) fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig::builder()
            .max_retries(5)
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(10))
            .build()
            .unwrap();

        let d0 = compute_backoff(&config, 0);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(150));
        let d2 = compute_backoff(&config, 2);
        assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(600));
    }

    #[test]
    fn test_compute_backoff_capped_at_max() {
        let config = RetryConfig::builder()
            .max_retries(10)
            .initial_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_secs(5))
            .build()
            .unwrap();
        let d = compute_backoff(&config, 40);
        assert!(d >= Duration::from_secs(5) && d <= Duration::from_millis(7_500));
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), None, "get", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Ok::<_, StorageError>(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let metrics = Metrics::new();
        let result = with_retry(&fast(3), Some(&metrics), "put", || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 { Err(StorageError::connection("refused")) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(metrics.snapshot().retries, 2);
        assert_eq!(metrics.snapshot().retries_exhausted, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_unavailable() {
        let calls = AtomicU32::new(0);
        let metrics = Metrics::new();
        let result: StorageResult<()> = with_retry(&fast(2), Some(&metrics), "get", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::timeout()) }
        })
        .await;

        match result.unwrap_err() {
            StorageError::Unavailable { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "Operation timeout");
            },
            other => unreachable!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.snapshot().retries_exhausted, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_retry(&fast(5), None, "put", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::internal("WRONGTYPE")) }
        })
        .await;
        assert!(matches!(result, Err(StorageError::Internal { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_still_maps_to_unavailable() {
        let result: StorageResult<()> =
            with_retry(&fast(0), None, "get", || async { Err(StorageError::connection("reset")) })
                .await;
        assert!(matches!(result, Err(StorageError::Unavailable { attempts: 1, .. })));
    }
}
