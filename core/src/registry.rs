//! Breaker registry and execution wrapper
//!
//! The registry owns one [`Breaker`] per service key and the shared
//! [`EventLog`]. Guarded calls go through [`BreakerRegistry::execute`]
//! (or [`execute_with`](BreakerRegistry::execute_with)), which never
//! propagates the call's error: every outcome is normalized into an
//! [`ExecutionResult`].

use crate::{
    builder::RegistryBuilder,
    callbacks::Callbacks,
    cancel::CancelToken,
    circuit::{Admission, Breaker, BreakerState, BreakerStats, CallOutcome},
    clock::{Clock, SystemClock},
    config::{BreakerConfig, BreakerConfigPatch},
    errors::ConfigError,
    events::{DEFAULT_EVENT_CAPACITY, Event, EventLog, FallbackReason},
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default number of events returned by [`BreakerRegistry::events`]
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// Default lookback of [`BreakerRegistry::recent_events`]
pub const DEFAULT_RECENT_SECS: u64 = 60;

/// Context provided to fallback closures
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub service_key: String,
    pub reason: FallbackReason,
    /// Breaker state when the call was rejected or settled
    pub state: BreakerState,
    /// Rejected because a sibling breaker is open
    pub global: bool,
    pub error: Option<String>,
}

/// Type alias for fallback function
pub type FallbackFn<T> = Box<dyn FnOnce(&FallbackContext) -> T + Send>;

/// Options for a guarded call
pub struct CallOptions<T> {
    /// Override merged into the breaker's config before the call
    pub config: Option<BreakerConfigPatch>,
    /// Produces `data` whenever the result is a fallback
    pub fallback: Option<FallbackFn<T>>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self {
            config: None,
            fallback: None,
        }
    }
}

impl<T> CallOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, patch: BreakerConfigPatch) -> Self {
        self.config = Some(patch);
        self
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> T + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

impl<T> fmt::Debug for CallOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("config", &self.config)
            .field("fallback", &self.fallback.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Structured result of a guarded call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult<T> {
    pub data: Option<T>,
    pub stats: BreakerStats,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    /// Wall time spent in the wrapper, in milliseconds
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ExecutionResult<T> {
    fn fallback(
        ctx: FallbackContext,
        fallback: Option<FallbackFn<T>>,
        stats: BreakerStats,
        duration: u64,
    ) -> Self {
        let data = fallback.map(|f| f(&ctx));
        Self {
            data,
            stats,
            fallback_used: true,
            fallback_reason: Some(ctx.reason),
            duration,
            error: ctx.error,
        }
    }
}

/// Owner of every breaker and of the event trail
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: DashMap<String, Arc<Breaker>>,
    events: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    callbacks: Callbacks,
}

impl BreakerRegistry {
    /// Registry with default config, system clock and a 1000-event log
    pub fn new() -> Self {
        Self::from_parts(
            BreakerConfig::default(),
            DEFAULT_EVENT_CAPACITY,
            Arc::new(SystemClock::new()),
            Callbacks::new(),
        )
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn from_parts(
        defaults: BreakerConfig,
        event_capacity: usize,
        clock: Arc<dyn Clock>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
            events: Arc::new(EventLog::with_capacity(event_capacity)),
            clock,
            callbacks,
        }
    }

    /// Config applied to breakers created from now on
    pub fn defaults(&self) -> &BreakerConfig {
        &self.defaults
    }

    /// Run `call` under the breaker for `service_key` with default options
    pub async fn execute<T, E, F, Fut>(&self, service_key: &str, call: F) -> ExecutionResult<T>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with(service_key, call, CallOptions::default())
            .await
    }

    /// Run `call` under the breaker for `service_key`
    ///
    /// The call races a deadline of `config.timeout` ms; if the deadline wins
    /// the call's future is dropped and its token cancelled.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        service_key: &str,
        call: F,
        options: CallOptions<T>,
    ) -> ExecutionResult<T>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let CallOptions { config, fallback } = options;
        let breaker = self.resolve(service_key, config.as_ref());
        let sibling_open = self.any_other_open(service_key);

        let permit = match breaker.admit(sibling_open) {
            Admission::Permitted(permit) => permit,
            Admission::Rejected { state, global } => {
                let ctx = FallbackContext {
                    service_key: service_key.to_string(),
                    reason: FallbackReason::Open,
                    state,
                    global,
                    error: None,
                };
                return ExecutionResult::fallback(
                    ctx,
                    fallback,
                    breaker.status(),
                    elapsed_ms(started),
                );
            }
        };

        let token = CancelToken::new();
        let timeout_ms = permit.timeout_ms;
        let settled = tokio::select! {
            result = call(token.clone()) => Some(result),
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        };
        let duration = elapsed_ms(started);

        let (reason, error) = match settled {
            Some(Ok(data)) => {
                breaker.record(&permit, CallOutcome::Success { duration });
                drop(permit);
                return ExecutionResult {
                    data: Some(data),
                    stats: breaker.status(),
                    fallback_used: false,
                    fallback_reason: None,
                    duration,
                    error: None,
                };
            }
            Some(Err(err)) => {
                let message = err.to_string();
                breaker.record(
                    &permit,
                    CallOutcome::Failure {
                        error: &message,
                        duration,
                    },
                );
                (FallbackReason::Error, message)
            }
            None => {
                token.cancel();
                breaker.record(&permit, CallOutcome::Timeout { duration });
                (
                    FallbackReason::Timeout,
                    format!("Operation timed out after {}ms", timeout_ms),
                )
            }
        };
        drop(permit);

        let stats = breaker.status();
        debug!(service = %service_key, reason = reason.as_str(), %error, "returning fallback");
        let ctx = FallbackContext {
            service_key: service_key.to_string(),
            reason,
            state: stats.state,
            global: false,
            error: Some(error),
        };
        ExecutionResult::fallback(ctx, fallback, stats, duration)
    }

    /// Handle to the breaker for `service_key`, if one exists
    pub fn breaker(&self, service_key: &str) -> Option<Arc<Breaker>> {
        self.breakers
            .get(service_key)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn breaker_status(&self, service_key: &str) -> Option<BreakerStats> {
        self.breaker(service_key).map(|breaker| breaker.status())
    }

    pub fn all_breaker_statuses(&self) -> BTreeMap<String, BreakerStats> {
        self.snapshot()
            .into_iter()
            .map(|breaker| (breaker.service_key().to_string(), breaker.status()))
            .collect()
    }

    /// Known service keys, sorted
    pub fn service_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Merge `patch` into an existing breaker's config
    ///
    /// Returns `Ok(None)` for an unknown key.
    pub fn update_breaker_config(
        &self,
        service_key: &str,
        patch: &BreakerConfigPatch,
    ) -> Result<Option<BreakerStats>, ConfigError> {
        let Some(breaker) = self.breaker(service_key) else {
            return Ok(None);
        };
        breaker.apply_patch(patch)?;
        info!(service = %service_key, ?patch, "breaker config updated");
        Ok(Some(breaker.status()))
    }

    /// Force one breaker back to Closed; returns whether the key exists
    pub fn reset_breaker(&self, service_key: &str) -> bool {
        match self.breaker(service_key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all_breakers(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    /// The `limit` most recent events (default 100), oldest first
    pub fn events(&self, limit: Option<usize>, service_key: Option<&str>) -> Vec<Event> {
        self.events
            .recent(limit.unwrap_or(DEFAULT_EVENT_LIMIT), service_key)
    }

    /// Events from the last `seconds` (default 60), oldest first
    pub fn recent_events(&self, seconds: Option<u64>, service_key: Option<&str>) -> Vec<Event> {
        let lookback = seconds.unwrap_or(DEFAULT_RECENT_SECS).saturating_mul(1000);
        let cutoff = self.clock.now_ms().saturating_sub(lookback);
        self.events.since(cutoff, service_key)
    }

    /// Drop every breaker and the event history
    pub fn clear(&self) {
        self.breakers.clear();
        self.events.clear();
    }

    fn resolve(&self, service_key: &str, patch: Option<&BreakerConfigPatch>) -> Arc<Breaker> {
        if let Some(existing) = self.breaker(service_key) {
            if let Some(patch) = patch {
                self.apply_override(&existing, patch);
            }
            return existing;
        }

        match self.breakers.entry(service_key.to_string()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                if let Some(patch) = patch {
                    self.apply_override(&existing, patch);
                }
                existing
            }
            Entry::Vacant(entry) => {
                let config = match patch {
                    Some(patch) => self.overridden_defaults(service_key, patch),
                    None => self.defaults.clone(),
                };
                let created = Arc::new(Breaker::new(
                    service_key,
                    config,
                    Arc::clone(&self.clock),
                    Arc::clone(&self.events),
                    self.callbacks.clone(),
                ));
                entry.insert(Arc::clone(&created));
                created
            }
        }
    }

    fn apply_override(&self, breaker: &Breaker, patch: &BreakerConfigPatch) {
        if let Err(err) = breaker.apply_patch(patch) {
            warn!(service = %breaker.service_key(), %err, "ignoring invalid config override");
        }
    }

    fn overridden_defaults(&self, service_key: &str, patch: &BreakerConfigPatch) -> BreakerConfig {
        let merged = self.defaults.merged(patch);
        match merged.validate() {
            Ok(()) => merged,
            Err(err) => {
                warn!(service = %service_key, %err, "ignoring invalid config override");
                self.defaults.clone()
            }
        }
    }

    /// Any sibling still inside its open period; never takes their core locks
    fn any_other_open(&self, service_key: &str) -> bool {
        let now = self.clock.now_ms();
        self.breakers
            .iter()
            .any(|entry| entry.key() != service_key && entry.value().is_open_at(now))
    }

    fn snapshot(&self) -> Vec<Arc<Breaker>> {
        let mut breakers: Vec<Arc<Breaker>> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        breakers.sort_by(|a, b| a.service_key().cmp(b.service_key()));
        breakers
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.breakers.len())
            .field("events", &self.events.len())
            .field("event_capacity", &self.events.capacity())
            .field("clock", &self.clock)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
