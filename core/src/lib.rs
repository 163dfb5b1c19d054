//! BreakerRegistry - Per-service circuit breakers with an audit trail
//!
//! This crate provides a registry of circuit breakers keyed by service:
//! - Rolling-window metrics in time buckets (absolute and rate-based tripping)
//! - State machine for the breaker lifecycle (Closed → Open → HalfOpen)
//! - Deadline racing for every guarded call, with cooperative cancellation
//! - Global protection: fresh breakers fail fast while a sibling is open
//! - Bounded, queryable event log of every transition and call outcome
//!
//! # Example
//!
//! ```rust
//! use breaker_registry::{BreakerRegistry, BreakerState};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let registry = BreakerRegistry::builder()
//!     .failure_threshold(3)
//!     .timeout_ms(1_000)
//!     .on_open(|key| println!("Circuit {} opened!", key))
//!     .build()
//!     .unwrap();
//!
//! // Execute with circuit protection
//! let result = registry
//!     .execute("payments", |_cancel| async { Ok::<_, String>("charged") })
//!     .await;
//! assert_eq!(result.data, Some("charged"));
//!
//! // Check circuit state
//! let stats = registry.breaker_status("payments").unwrap();
//! assert_eq!(stats.state, BreakerState::Closed);
//! # });
//! ```

pub mod builder;
pub mod callbacks;
pub mod cancel;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod in_flight;
pub mod registry;
pub mod window;

pub use builder::RegistryBuilder;
pub use callbacks::Callbacks;
pub use cancel::CancelToken;
pub use circuit::{Breaker, BreakerState, BreakerStats, Metrics, Totals};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, BreakerConfigPatch};
pub use errors::ConfigError;
pub use events::{Event, EventDetails, EventLog, EventType, FallbackReason};
pub use registry::{BreakerRegistry, CallOptions, ExecutionResult, FallbackContext};
pub use window::{Outcome, RollingWindow, TimeBucket, WindowMetrics};
