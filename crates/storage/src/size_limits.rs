//! Key and value size limits.
//!
//! Ingest checks every record key and encoded record against [`SizeLimits`]
//! before anything reaches the backing store, so one oversized payload
//! cannot stall the store or blow up cache weights.
//!
//! | Limit | Default |
//! |-------|---------|
//! | `max_key_size` | 512 bytes |
//! | `max_value_size` | 1 MiB |

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StorageError};

/// Default maximum key size in bytes.
pub const DEFAULT_MAX_KEY_SIZE: usize = 512;

/// Default maximum encoded record size in bytes.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Validated size ceilings. Both limits are at least one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSizeLimits", into = "RawSizeLimits")]
pub struct SizeLimits {
    max_key_size: usize,
    max_value_size: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSizeLimits {
    #[serde(default = "default_max_key_size")]
    max_key_size: usize,
    #[serde(default = "default_max_value_size")]
    max_value_size: usize,
}

fn default_max_key_size() -> usize {
    DEFAULT_MAX_KEY_SIZE
}

fn default_max_value_size() -> usize {
    DEFAULT_MAX_VALUE_SIZE
}

impl TryFrom<RawSizeLimits> for SizeLimits {
    type Error = ConfigError;

    fn try_from(raw: RawSizeLimits) -> Result<Self, Self::Error> {
        Self::new(raw.max_key_size, raw.max_value_size)
    }
}

impl From<SizeLimits> for RawSizeLimits {
    fn from(limits: SizeLimits) -> Self {
        Self { max_key_size: limits.max_key_size, max_value_size: limits.max_value_size }
    }
}

impl SizeLimits {
    /// Creates limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if either limit is zero.
    pub fn new(max_key_size: usize, max_value_size: usize) -> Result<Self, ConfigError> {
        for (field, value) in [("max_key_size", max_key_size), ("max_value_size", max_value_size)] {
            if value == 0 {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: "0".into(),
                    min: "1".into(),
                });
            }
        }
        Ok(Self { max_key_size, max_value_size })
    }

    /// Maximum key size in bytes.
    #[must_use]
    pub fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    /// Maximum value size in bytes.
    #[must_use]
    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self { max_key_size: DEFAULT_MAX_KEY_SIZE, max_value_size: DEFAULT_MAX_VALUE_SIZE }
    }
}

/// Checks a key and value against `limits`.
///
/// # Errors
///
/// Returns [`StorageError::SizeLimitExceeded`] naming the first violated limit.
pub fn validate_sizes(key: &str, value: &[u8], limits: &SizeLimits) -> Result<(), StorageError> {
    if key.len() > limits.max_key_size {
        return Err(StorageError::size_limit_exceeded("key", key.len(), limits.max_key_size));
    }
    if value.len() > limits.max_value_size {
        return Err(StorageError::size_limit_exceeded("value", value.len(), limits.max_value_size));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn zero_limits_rejected() {
        let err = SizeLimits::new(0, 1024).unwrap_err();
        assert!(err.to_string().contains("max_key_size"), "error should name the field: {err}");
        let err = SizeLimits::new(1, 0).unwrap_err();
        assert!(err.to_string().contains("max_value_size"), "error should name the field: {err}");
    }

    #[rstest]
    #[case::within_limits(10, 20, 10, 20, true)]
    #[case::key_one_byte_over(5, 10, 6, 10, false)]
    #[case::value_one_byte_over(5, 10, 5, 11, false)]
    fn validate_sizes_parametric(
        #[case] max_key: usize,
        #[case] max_value: usize,
        #[case] key_len: usize,
        #[case] value_len: usize,
        #[case] ok: bool,
    ) {
        let limits = SizeLimits::new(max_key, max_value).unwrap();
        let key = "k".repeat(key_len);
        let value = vec![0u8; value_len];
        assert_eq!(validate_sizes(&key, &value, &limits).is_ok(), ok);
    }

    #[test]
    fn error_names_the_limit() {
        let limits = SizeLimits::new(4, 4).unwrap();
        let err = validate_sizes("ok", &[0; 9], &limits).unwrap_err();
        assert!(matches!(
            err,
            StorageError::SizeLimitExceeded { ref kind, actual: 9, limit: 4 } if kind == "value"
        ));
    }

    #[test]
    fn deserialize_validates() {
        let limits: SizeLimits = serde_json::from_str(r#"{"max_key_size": 64}"#).unwrap();
        assert_eq!(limits.max_key_size(), 64);
        assert_eq!(limits.max_value_size(), DEFAULT_MAX_VALUE_SIZE);
        assert!(serde_json::from_str::<SizeLimits>(r#"{"max_value_size": 0}"#).is_err());
    }
}
