//! Per-key circuit breaker built on a state machine
//!
//! ```text
//! Closed   → Open      window failures/timeouts ≥ threshold, or rate ≥ threshold
//! Open     → HalfOpen  reset timeout elapsed
//! HalfOpen → Closed    consecutive probe successes ≥ success threshold
//! HalfOpen → Open      first probe failure or timeout
//! ```
//!
//! Transitions are re-evaluated every time a breaker is touched. All
//! bookkeeping of one breaker happens under its own lock; there is no lock
//! shared across keys apart from the event log.

use crate::{
    callbacks::Callbacks,
    clock::{Clock, SystemClock},
    config::{BreakerConfig, BreakerConfigPatch},
    errors::ConfigError,
    events::{EventDetails, EventLog, FallbackReason},
    in_flight::{InFlight, InFlightGuard},
    window::{Outcome, RollingWindow, TimeBucket, WindowMetrics},
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => BreakerState::Open,
            "HalfOpen" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit context - shared data the guards read
#[derive(Clone)]
pub struct CircuitContext {
    pub service_key: String,
    pub config: Arc<RwLock<BreakerConfig>>,
    pub window: Arc<RollingWindow>,
    pub clock: Arc<dyn Clock>,
}

impl CircuitContext {
    fn config(&self) -> BreakerConfig {
        self.config.read().clone()
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            service_key: String::new(),
            config: Arc::new(RwLock::new(BreakerConfig::default())),
            window: Arc::new(RollingWindow::new()),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("service_key", &self.service_key)
            .field("config", &*self.config.read())
            .field("window", &self.window)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: u64,
    /// Reset delay drawn on entry when jitter is enabled
    pub jittered_timeout: Option<u64>,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: u32,
    pub failed_probes: u32,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Window failures or failure rate crossed a threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let config = ctx.config();
        let metrics = ctx.window.metrics(ctx.clock.now_ms(), &config);
        trip_reason(&metrics, &config).is_some()
    }
}

impl Circuit<HalfOpen> {
    /// A probe failed; no tolerance while probing
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.failed_probes > 0)
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        let threshold = ctx.config.read().success_threshold;
        self.state_data_half_open()
            .is_some_and(|data| data.consecutive_successes >= threshold)
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let Some(data) = self.state_data_open() else {
            return false;
        };
        let timeout = data
            .jittered_timeout
            .unwrap_or_else(|| ctx.config.read().reset_timeout);
        ctx.clock.now_ms().saturating_sub(data.opened_at) >= timeout
    }
}

/// Reason the circuit should open, if either trip clause holds
///
/// A `failure_threshold` of 0 disables the absolute clause.
pub(crate) fn trip_reason(metrics: &WindowMetrics, config: &BreakerConfig) -> Option<String> {
    let unhealthy = metrics.unhealthy();
    if config.failure_threshold > 0 && unhealthy >= u64::from(config.failure_threshold) {
        return Some(format!(
            "Failure threshold reached: {} failures in window (threshold {})",
            unhealthy, config.failure_threshold
        ));
    }

    let requests = metrics.requests();
    let rate = metrics.failure_rate();
    if requests > 0
        && requests >= u64::from(config.minimum_request_volume)
        && rate >= config.failure_rate_threshold
    {
        return Some(format!(
            "Failure rate {:.1}% over {} requests (threshold {}%)",
            rate, requests, config.failure_rate_threshold
        ));
    }

    None
}

fn jittered_reset_timeout(config: &BreakerConfig) -> Option<u64> {
    if config.jitter_factor <= 0.0 {
        return None;
    }
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: config.reset_timeout,
        multiplier: 1.0,
        max_delay_ms: config.reset_timeout,
    };
    Some(policy.calculate_delay(1, config.jitter_factor) as u64)
}

/// Lifetime outcome counters, zeroed whenever the breaker closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl Totals {
    /// No traffic has been recorded since the breaker last closed
    pub fn is_empty(&self) -> bool {
        self.successes == 0 && self.failures == 0 && self.timeouts == 0
    }
}

/// Lifetime totals plus the current window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub window_successes: u64,
    pub window_failures: u64,
    pub window_timeouts: u64,
    pub window_requests: u64,
    pub window_failure_rate: f64,
    pub buckets: Vec<TimeBucket>,
}

impl Metrics {
    fn new(totals: Totals, window: WindowMetrics) -> Self {
        Self {
            successes: totals.successes,
            failures: totals.failures,
            timeouts: totals.timeouts,
            window_successes: window.successes,
            window_failures: window.failures,
            window_timeouts: window.timeouts,
            window_requests: window.requests(),
            window_failure_rate: window.failure_rate(),
            buckets: window.buckets,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub state: BreakerState,
    pub metrics: Metrics,
    pub last_state_change: u64,
    pub consecutive_successes: u32,
    pub current_in_flight: usize,
    pub config: BreakerConfig,
}

/// Outcome of a guarded call, as reported back to its breaker
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallOutcome<'a> {
    Success { duration: u64 },
    Failure { error: &'a str, duration: u64 },
    Timeout { duration: u64 },
}

/// Ticket for an admitted call; dropping it releases the in-flight slot
#[derive(Debug)]
pub(crate) struct Permit {
    _guard: InFlightGuard,
    /// State the call was admitted in; only HalfOpen admissions are probes
    pub state: BreakerState,
    pub timeout_ms: u64,
}

/// `open_for` marker meaning the live `reset_timeout` applies
const LIVE_RESET_TIMEOUT: u64 = u64::MAX;

#[derive(Debug)]
pub(crate) enum Admission {
    Permitted(Permit),
    Rejected { state: BreakerState, global: bool },
}

struct BreakerCore {
    machine: DynamicCircuit,
    last_state_change: u64,
    totals: Totals,
}

/// Breaker guarding one service key
pub struct Breaker {
    context: CircuitContext,
    core: Mutex<BreakerCore>,
    /// Lock-free mirror of the machine state for cross-key reads
    published: AtomicU8,
    opened_at: AtomicU64,
    open_for: AtomicU64,
    in_flight: Arc<InFlight>,
    journal: Arc<EventLog>,
    callbacks: Callbacks,
}

impl Breaker {
    pub(crate) fn new(
        service_key: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        journal: Arc<EventLog>,
        callbacks: Callbacks,
    ) -> Self {
        let context = CircuitContext {
            service_key: service_key.into(),
            config: Arc::new(RwLock::new(config)),
            window: Arc::new(RollingWindow::new()),
            clock,
        };
        let core = BreakerCore {
            machine: DynamicCircuit::new(context.clone()),
            last_state_change: context.clock.now_ms(),
            totals: Totals::default(),
        };

        Self {
            context,
            core: Mutex::new(core),
            published: AtomicU8::new(BreakerState::Closed.to_u8()),
            opened_at: AtomicU64::new(0),
            open_for: AtomicU64::new(LIVE_RESET_TIMEOUT),
            in_flight: Arc::new(InFlight::new()),
            journal,
            callbacks,
        }
    }

    pub fn service_key(&self) -> &str {
        &self.context.service_key
    }

    /// Last published state; may lag behind a pending timeout-driven transition
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.published.load(Ordering::Acquire))
    }

    /// Open and still inside its reset timeout at `now`
    ///
    /// Reads only the published atomics and the config, never the core lock,
    /// so an Open breaker whose timeout elapsed counts as recovering even
    /// before anyone queries it.
    pub fn is_open_at(&self, now: u64) -> bool {
        if self.state() != BreakerState::Open {
            return false;
        }
        let timeout = match self.open_for.load(Ordering::Relaxed) {
            LIVE_RESET_TIMEOUT => self.context.config.read().reset_timeout,
            jittered => jittered,
        };
        now.saturating_sub(self.opened_at.load(Ordering::Relaxed)) < timeout
    }

    pub fn config(&self) -> BreakerConfig {
        self.context.config()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Merge `patch` into the effective config; invalid results are rejected
    pub(crate) fn apply_patch(&self, patch: &BreakerConfigPatch) -> Result<(), ConfigError> {
        let mut config = self.context.config.write();
        let merged = config.merged(patch);
        merged.validate()?;
        *config = merged;
        Ok(())
    }

    /// Decide whether a call may run, recording a fallback or request event
    pub(crate) fn admit(&self, sibling_open: bool) -> Admission {
        let mut core = self.core.lock();
        self.evaluate(&mut core);

        let now = self.now();
        let state = self.current(&core);
        let global = state == BreakerState::Closed && core.totals.is_empty() && sibling_open;

        if state == BreakerState::Open || global {
            debug!(service = %self.service_key(), global, "call rejected");
            self.journal.append(
                now,
                self.service_key(),
                EventDetails::Fallback {
                    reason: FallbackReason::Open,
                    global,
                },
            );
            return Admission::Rejected { state, global };
        }

        let guard = self.in_flight.enter();
        self.journal
            .append(now, self.service_key(), EventDetails::Request { state });

        Admission::Permitted(Permit {
            _guard: guard,
            state,
            timeout_ms: self.context.config.read().timeout,
        })
    }

    /// Feed the outcome of an admitted call into totals, window and state
    ///
    /// Only calls admitted while HalfOpen drive the probe logic; a call
    /// admitted earlier that settles during HalfOpen is counted but cannot
    /// close or reopen the circuit.
    pub(crate) fn record(&self, permit: &Permit, outcome: CallOutcome<'_>) {
        let mut core = self.core.lock();
        let now = self.now();
        let config = self.config();
        let probing = permit.state == BreakerState::HalfOpen
            && self.current(&core) == BreakerState::HalfOpen;

        match outcome {
            CallOutcome::Success { duration } => {
                core.totals.successes += 1;
                self.context.window.record(Outcome::Success, now, &config);
                self.journal
                    .append(now, self.service_key(), EventDetails::Success { duration });

                if probing {
                    let successes = match core.machine.half_open_data_mut() {
                        Some(data) => {
                            data.consecutive_successes += 1;
                            data.consecutive_successes
                        }
                        None => 0,
                    };
                    if core.machine.handle(CircuitEvent::Close).is_ok() {
                        self.transitioned(
                            &mut core,
                            BreakerState::HalfOpen,
                            format!("{} consecutive probe successes", successes),
                        );
                    }
                }
            }
            CallOutcome::Failure { error, duration } => {
                core.totals.failures += 1;
                self.context.window.record(Outcome::Failure, now, &config);
                self.journal.append(
                    now,
                    self.service_key(),
                    EventDetails::Failure {
                        error: error.to_string(),
                        duration,
                    },
                );
                debug!(service = %self.service_key(), error, "guarded call failed");

                if probing {
                    self.reopen(&mut core, format!("Probe failure: {}", error));
                }
            }
            CallOutcome::Timeout { duration } => {
                core.totals.timeouts += 1;
                self.context.window.record(Outcome::Timeout, now, &config);
                self.journal.append(
                    now,
                    self.service_key(),
                    EventDetails::Timeout {
                        timeout: config.timeout,
                        duration,
                    },
                );
                debug!(service = %self.service_key(), timeout_ms = config.timeout, "guarded call timed out");

                if probing {
                    self.reopen(&mut core, "Probe timeout".to_string());
                }
            }
        }

        self.evaluate(&mut core);
    }

    /// Current stats after applying any pending transition
    pub fn status(&self) -> BreakerStats {
        let mut core = self.core.lock();
        self.evaluate(&mut core);
        self.snapshot(&core)
    }

    /// Force the breaker back to Closed with empty counters
    ///
    /// A breaker that is already Closed only has its counters cleared; no
    /// state change is recorded.
    pub(crate) fn reset(&self) {
        let mut core = self.core.lock();
        let from = self.current(&core);
        core.machine = DynamicCircuit::new(self.context.clone());
        if from == BreakerState::Closed {
            core.totals = Totals::default();
            self.context.window.clear();
            info!(service = %self.service_key(), "closed circuit counters reset");
            return;
        }
        self.transitioned(&mut core, from, "Manual reset".to_string());
    }

    fn now(&self) -> u64 {
        self.context.clock.now_ms()
    }

    fn current(&self, core: &BreakerCore) -> BreakerState {
        BreakerState::from_machine(core.machine.current_state())
    }

    fn evaluate(&self, core: &mut BreakerCore) {
        match self.current(core) {
            BreakerState::Closed => {
                let config = self.config();
                let metrics = self.context.window.metrics(self.now(), &config);
                if let Some(reason) = trip_reason(&metrics, &config)
                    && core.machine.handle(CircuitEvent::Trip).is_ok()
                {
                    self.transitioned(core, BreakerState::Closed, reason);
                }
            }
            BreakerState::Open => {
                if core.machine.handle(CircuitEvent::AttemptReset).is_ok() {
                    self.transitioned(core, BreakerState::Open, "Reset timeout elapsed".to_string());
                }
            }
            BreakerState::HalfOpen => {
                if core.machine.handle(CircuitEvent::Close).is_ok() {
                    self.transitioned(
                        core,
                        BreakerState::HalfOpen,
                        "Success threshold reached".to_string(),
                    );
                }
            }
        }
    }

    fn reopen(&self, core: &mut BreakerCore, reason: String) {
        if let Some(data) = core.machine.half_open_data_mut() {
            data.failed_probes += 1;
        }
        if core.machine.handle(CircuitEvent::Trip).is_ok() {
            self.transitioned(core, BreakerState::HalfOpen, reason);
        }
    }

    /// Entry bookkeeping for the state the machine just moved to
    fn transitioned(&self, core: &mut BreakerCore, from: BreakerState, reason: String) {
        let now = self.now();
        let to = self.current(core);
        core.last_state_change = now;

        match to {
            BreakerState::Open => {
                let config = self.config();
                let jittered = jittered_reset_timeout(&config);
                if let Some(data) = core.machine.open_data_mut() {
                    data.opened_at = now;
                    data.jittered_timeout = jittered;
                }
                self.opened_at.store(now, Ordering::Relaxed);
                self.open_for
                    .store(jittered.unwrap_or(LIVE_RESET_TIMEOUT), Ordering::Relaxed);
                warn!(service = %self.service_key(), %from, %to, %reason, "circuit opened");
            }
            BreakerState::HalfOpen => {
                info!(service = %self.service_key(), %from, %to, %reason, "circuit probing");
            }
            BreakerState::Closed => {
                core.totals = Totals::default();
                self.context.window.clear();
                info!(service = %self.service_key(), %from, %to, %reason, "circuit closed");
            }
        }

        self.published.store(to.to_u8(), Ordering::Release);
        self.journal.append(
            now,
            self.service_key(),
            EventDetails::StateChange {
                from_state: from,
                to_state: to,
                reason,
            },
        );
        self.callbacks.trigger(to, self.service_key());
    }

    fn snapshot(&self, core: &BreakerCore) -> BreakerStats {
        let config = self.config();
        let window = self.context.window.metrics(self.now(), &config);

        BreakerStats {
            state: self.current(core),
            metrics: Metrics::new(core.totals, window),
            last_state_change: core.last_state_change,
            consecutive_successes: core
                .machine
                .half_open_data()
                .map_or(0, |data| data.consecutive_successes),
            current_in_flight: self.in_flight.current(),
            config,
        }
    }
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breaker")
            .field("service_key", &self.context.service_key)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight.current())
            .finish()
    }
}
