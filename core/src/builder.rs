//! Builder API for ergonomic registry configuration

use crate::{
    callbacks::Callbacks,
    clock::{Clock, SystemClock},
    config::BreakerConfig,
    errors::ConfigError,
    events::DEFAULT_EVENT_CAPACITY,
    registry::BreakerRegistry,
};
use std::sync::Arc;

/// Builder for creating registries with fluent API
///
/// Field setters change the defaults every new breaker starts from.
pub struct RegistryBuilder {
    defaults: BreakerConfig,
    event_capacity: usize,
    clock: Option<Arc<dyn Clock>>,
    callbacks: Callbacks,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            defaults: BreakerConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            clock: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the default config wholesale
    pub fn defaults(mut self, config: BreakerConfig) -> Self {
        self.defaults = config;
        self
    }

    /// Window failures plus timeouts that open the circuit (0 disables)
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.defaults.failure_threshold = threshold;
        self
    }

    /// Set the failure rate threshold in percent (clamped to 0-100)
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.defaults.failure_rate_threshold = percent.clamp(0.0, 100.0);
        self
    }

    /// Set minimum window requests before the rate threshold is evaluated
    pub fn minimum_request_volume(mut self, requests: u32) -> Self {
        self.defaults.minimum_request_volume = requests;
        self
    }

    pub fn reset_timeout_ms(mut self, ms: u64) -> Self {
        self.defaults.reset_timeout = ms;
        self
    }

    /// Set the success threshold (probe successes needed to close)
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.defaults.success_threshold = threshold;
        self
    }

    /// Deadline for each guarded call
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.defaults.timeout = ms;
        self
    }

    pub fn rolling_window_ms(mut self, ms: u64) -> Self {
        self.defaults.rolling_window_size = ms;
        self
    }

    pub fn rolling_bucket_count(mut self, buckets: u32) -> Self {
        self.defaults.rolling_bucket_count = buckets;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.defaults.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Maximum number of events kept in the audit trail
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set custom time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set callback for when a circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Build the registry, validating the default config
    pub fn build(self) -> Result<BreakerRegistry, ConfigError> {
        self.defaults.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        Ok(BreakerRegistry::from_parts(
            self.defaults,
            self.event_capacity,
            clock,
            self.callbacks,
        ))
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
