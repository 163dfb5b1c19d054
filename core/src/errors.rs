//! Error types for breaker configuration

use thiserror::Error;

/// Rejected breaker configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A field that must be strictly positive was zero
    #[error("`{field}` must be greater than 0")]
    Zero { field: &'static str },

    /// A bounded field fell outside its range
    #[error("`{field}` must be within {min}..={max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The rolling window cannot be split into the requested buckets
    #[error("rolling window of {window_ms}ms cannot hold {buckets} buckets")]
    BucketsExceedWindow { window_ms: u64, buckets: u32 },
}
