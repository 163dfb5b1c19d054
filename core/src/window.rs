//! Rolling window of call outcomes
//!
//! Outcomes are aggregated into fixed-width time buckets aligned to
//! `rolling_window_size / rolling_bucket_count`. Reads sum the buckets that
//! start inside the trailing window, so every query is O(bucket count).

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Classified result of one guarded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Aggregate counts for one slice of the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    pub bucket_start: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl TimeBucket {
    fn new(bucket_start: u64) -> Self {
        Self {
            bucket_start,
            ..Default::default()
        }
    }

    fn bump(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Timeout => self.timeouts += 1,
        }
    }
}

/// Sums over the buckets of the current window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowMetrics {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub buckets: Vec<TimeBucket>,
}

impl WindowMetrics {
    pub fn requests(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    /// Failures and timeouts together; both count against the breaker
    pub fn unhealthy(&self) -> u64 {
        self.failures + self.timeouts
    }

    /// Percentage (0-100) of unhealthy outcomes, `0.0` for an empty window
    pub fn failure_rate(&self) -> f64 {
        let total = self.requests();
        if total == 0 {
            0.0
        } else {
            self.unhealthy() as f64 / total as f64 * 100.0
        }
    }
}

/// Thread-safe bucket store for a single breaker
#[derive(Debug, Default)]
pub struct RollingWindow {
    /// Ordered by `bucket_start`, at most one bucket per aligned start
    buckets: Mutex<VecDeque<TimeBucket>>,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `outcome` in the bucket covering `now_ms` and drop expired buckets
    pub fn record(&self, outcome: Outcome, now_ms: u64, config: &BreakerConfig) {
        let width = config.bucket_width_ms();
        let start = now_ms / width * width;
        let mut buckets = self.buckets.lock();

        match buckets.back().map(|b| b.bucket_start) {
            Some(newest) if newest == start => {
                if let Some(bucket) = buckets.back_mut() {
                    bucket.bump(outcome);
                }
            }
            Some(newest) if start < newest => {
                // Clock went backwards: never open a bucket behind the newest
                let target = buckets
                    .iter_mut()
                    .rev()
                    .find(|b| b.bucket_start == start);
                match target {
                    Some(bucket) => bucket.bump(outcome),
                    None => {
                        if let Some(bucket) = buckets.back_mut() {
                            bucket.bump(outcome);
                        }
                    }
                }
            }
            _ => {
                let mut bucket = TimeBucket::new(start);
                bucket.bump(outcome);
                buckets.push_back(bucket);
            }
        }

        let cutoff = now_ms.saturating_sub(config.rolling_window_size);
        while buckets.front().is_some_and(|b| b.bucket_start < cutoff) {
            buckets.pop_front();
        }
    }

    /// Aggregate the buckets that start inside the trailing window
    pub fn metrics(&self, now_ms: u64, config: &BreakerConfig) -> WindowMetrics {
        let cutoff = now_ms.saturating_sub(config.rolling_window_size);
        let buckets = self.buckets.lock();

        let active: Vec<TimeBucket> = buckets
            .iter()
            .filter(|b| b.bucket_start >= cutoff)
            .copied()
            .collect();

        WindowMetrics {
            successes: active.iter().map(|b| b.successes).sum(),
            failures: active.iter().map(|b| b.failures).sum(),
            timeouts: active.iter().map(|b| b.timeouts).sum(),
            buckets: active,
        }
    }

    /// Discard all buckets
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            rolling_window_size: 10_000,
            rolling_bucket_count: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_window_is_zero() {
        let window = RollingWindow::new();
        let metrics = window.metrics(50_000, &config());

        assert_eq!(metrics.requests(), 0);
        assert_eq!(metrics.failure_rate(), 0.0);
        assert!(metrics.buckets.is_empty());
    }

    #[test]
    fn test_same_tick_shares_one_bucket() {
        let window = RollingWindow::new();
        let cfg = config();

        window.record(Outcome::Success, 12_345, &cfg);
        window.record(Outcome::Failure, 12_345, &cfg);
        window.record(Outcome::Timeout, 12_999, &cfg);

        let metrics = window.metrics(12_999, &cfg);
        assert_eq!(window.len(), 1);
        assert_eq!(metrics.buckets[0].bucket_start, 12_000);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.timeouts, 1);
    }

    #[test]
    fn test_rate_counts_timeouts_as_unhealthy() {
        let window = RollingWindow::new();
        let cfg = config();

        window.record(Outcome::Success, 1_000, &cfg);
        window.record(Outcome::Failure, 2_000, &cfg);
        window.record(Outcome::Timeout, 3_000, &cfg);
        window.record(Outcome::Success, 4_000, &cfg);

        let metrics = window.metrics(4_000, &cfg);
        assert_eq!(metrics.requests(), 4);
        assert_eq!(metrics.unhealthy(), 2);
        assert_eq!(metrics.failure_rate(), 50.0);
    }

    #[test]
    fn test_expired_buckets_are_ignored_then_dropped() {
        let window = RollingWindow::new();
        let cfg = config();

        window.record(Outcome::Failure, 1_000, &cfg);
        window.record(Outcome::Failure, 5_000, &cfg);

        // At 12_500 the cutoff is 2_500: the 1_000 bucket is out
        let metrics = window.metrics(12_500, &cfg);
        assert_eq!(metrics.failures, 1);
        assert_eq!(window.len(), 2);

        window.record(Outcome::Success, 12_500, &cfg);
        assert_eq!(window.len(), 2);
        assert_eq!(window.metrics(12_500, &cfg).requests(), 2);
    }

    #[test]
    fn test_backward_clock_never_reorders_buckets() {
        let window = RollingWindow::new();
        let cfg = config();

        window.record(Outcome::Success, 5_000, &cfg);
        window.record(Outcome::Success, 8_000, &cfg);
        window.record(Outcome::Failure, 5_500, &cfg);
        window.record(Outcome::Failure, 6_500, &cfg);

        let metrics = window.metrics(8_000, &cfg);
        assert_eq!(window.len(), 2);
        assert_eq!(metrics.buckets[0].failures, 1);
        assert_eq!(metrics.buckets[1].failures, 1);
        assert!(metrics.buckets[0].bucket_start < metrics.buckets[1].bucket_start);
    }

    #[test]
    fn test_rate_matches_manual_filtering() {
        let window = RollingWindow::new();
        let cfg = config();
        let mut log = Vec::new();

        // Deterministic pseudo-random sequence spread over 30 seconds
        let mut seed: u64 = 42;
        let mut now = 0;
        for _ in 0..300 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            now += (seed >> 33) % 200;
            let outcome = match (seed >> 20) % 3 {
                0 => Outcome::Success,
                1 => Outcome::Failure,
                _ => Outcome::Timeout,
            };
            window.record(outcome, now, &cfg);
            log.push((now, outcome));
        }

        let width = cfg.bucket_width_ms();
        let cutoff = now.saturating_sub(cfg.rolling_window_size);
        let in_window: Vec<Outcome> = log
            .iter()
            .filter(|(t, _)| t / width * width >= cutoff)
            .map(|(_, o)| *o)
            .collect();
        let unhealthy = in_window
            .iter()
            .filter(|o| **o != Outcome::Success)
            .count();
        let expected = unhealthy as f64 / in_window.len() as f64 * 100.0;

        let metrics = window.metrics(now, &cfg);
        assert_eq!(metrics.requests(), in_window.len() as u64);
        assert!((metrics.failure_rate() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_clear() {
        let window = RollingWindow::new();
        window.record(Outcome::Failure, 1_000, &config());
        window.clear();

        assert!(window.is_empty());
    }
}
