//! Breaker configuration and partial overrides

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};

/// Effective configuration of one breaker
///
/// Durations are milliseconds. Serialized field names are camelCase so the
/// struct can be read straight from the configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Failures plus timeouts inside the window that force the circuit open
    pub failure_threshold: u32,

    /// How long an open circuit waits before letting a probe through
    pub reset_timeout: u64,

    /// Consecutive probe successes needed to close from half-open
    pub success_threshold: u32,

    /// Deadline for a single guarded call
    pub timeout: u64,

    /// Requests inside the window before the rate threshold applies
    pub minimum_request_volume: u32,

    /// Failure rate (percent, 0-100) that opens the circuit
    pub failure_rate_threshold: f64,

    /// Length of the trailing window
    pub rolling_window_size: u64,

    /// Number of buckets the window is split into
    pub rolling_bucket_count: u32,

    /// Jitter factor for reset_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: 30_000,
            success_threshold: 3,
            timeout: 5_000,
            minimum_request_volume: 10,
            failure_rate_threshold: 50.0,
            rolling_window_size: 60_000,
            rolling_bucket_count: 10,
            jitter_factor: 0.0,
        }
    }
}

impl BreakerConfig {
    /// Width of one bucket in milliseconds
    pub fn bucket_width_ms(&self) -> u64 {
        (self.rolling_window_size / u64::from(self.rolling_bucket_count.max(1))).max(1)
    }

    /// Copy of this config with every field present in `patch` replaced
    pub fn merged(&self, patch: &BreakerConfigPatch) -> Self {
        Self {
            failure_threshold: patch.failure_threshold.unwrap_or(self.failure_threshold),
            reset_timeout: patch.reset_timeout.unwrap_or(self.reset_timeout),
            success_threshold: patch.success_threshold.unwrap_or(self.success_threshold),
            timeout: patch.timeout.unwrap_or(self.timeout),
            minimum_request_volume: patch
                .minimum_request_volume
                .unwrap_or(self.minimum_request_volume),
            failure_rate_threshold: patch
                .failure_rate_threshold
                .unwrap_or(self.failure_rate_threshold),
            rolling_window_size: patch.rolling_window_size.unwrap_or(self.rolling_window_size),
            rolling_bucket_count: patch
                .rolling_bucket_count
                .unwrap_or(self.rolling_bucket_count),
            jitter_factor: patch.jitter_factor.unwrap_or(self.jitter_factor),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.success_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "successThreshold",
            });
        }
        if self.timeout == 0 {
            return Err(ConfigError::Zero { field: "timeout" });
        }
        if self.rolling_window_size == 0 {
            return Err(ConfigError::Zero {
                field: "rollingWindowSize",
            });
        }
        if self.rolling_bucket_count == 0 {
            return Err(ConfigError::Zero {
                field: "rollingBucketCount",
            });
        }
        if self.rolling_window_size < u64::from(self.rolling_bucket_count) {
            return Err(ConfigError::BucketsExceedWindow {
                window_ms: self.rolling_window_size,
                buckets: self.rolling_bucket_count,
            });
        }
        check_range("failureRateThreshold", self.failure_rate_threshold, 100.0)?;
        check_range("jitterFactor", self.jitter_factor, 1.0)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, max: f64) -> Result<(), ConfigError> {
    if (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max,
        })
    }
}

/// Partial configuration; only the present fields are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_request_volume: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_window_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_bucket_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,
}

impl BreakerConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn reset_timeout(mut self, ms: u64) -> Self {
        self.reset_timeout = Some(ms);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    pub fn minimum_request_volume(mut self, requests: u32) -> Self {
        self.minimum_request_volume = Some(requests);
        self
    }

    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = Some(percent);
        self
    }

    pub fn rolling_window_size(mut self, ms: u64) -> Self {
        self.rolling_window_size = Some(ms);
        self
    }

    pub fn rolling_bucket_count(mut self, buckets: u32) -> Self {
        self.rolling_bucket_count = Some(buckets);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BreakerConfig::default();

        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, 30_000);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.timeout, 5_000);
        assert_eq!(config.minimum_request_volume, 10);
        assert_eq!(config.failure_rate_threshold, 50.0);
        assert_eq!(config.rolling_window_size, 60_000);
        assert_eq!(config.rolling_bucket_count, 10);
        assert_eq!(config.bucket_width_ms(), 6_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_only_touches_present_fields() {
        let patch = BreakerConfigPatch::new().failure_threshold(2).timeout(100);
        let merged = BreakerConfig::default().merged(&patch);

        assert_eq!(merged.failure_threshold, 2);
        assert_eq!(merged.timeout, 100);
        assert_eq!(merged.reset_timeout, 30_000);
        assert_eq!(merged.rolling_bucket_count, 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_buckets = BreakerConfig {
            rolling_bucket_count: 0,
            ..Default::default()
        };
        assert_eq!(
            zero_buckets.validate(),
            Err(ConfigError::Zero {
                field: "rollingBucketCount"
            })
        );

        let rate = BreakerConfig {
            failure_rate_threshold: 150.0,
            ..Default::default()
        };
        assert!(matches!(
            rate.validate(),
            Err(ConfigError::OutOfRange {
                field: "failureRateThreshold",
                ..
            })
        ));

        let tiny_window = BreakerConfig {
            rolling_window_size: 5,
            rolling_bucket_count: 10,
            ..Default::default()
        };
        assert!(matches!(
            tiny_window.validate(),
            Err(ConfigError::BucketsExceedWindow { .. })
        ));
    }

    #[test]
    fn test_deserialize_partial_documents() {
        let config: BreakerConfig =
            serde_json::from_str(r#"{"failureThreshold": 7, "resetTimeout": 1000}"#).unwrap();
        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.reset_timeout, 1_000);
        assert_eq!(config.success_threshold, 3);

        let patch: BreakerConfigPatch = serde_json::from_str(r#"{"timeout": 250}"#).unwrap();
        assert_eq!(patch, BreakerConfigPatch::new().timeout(250));
    }
}
