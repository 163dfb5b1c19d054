//! Audit trail shared by every breaker of a registry
//!
//! A bounded FIFO: once `capacity` is reached the oldest event is evicted
//! for each new one.

use crate::circuit::BreakerState;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of events kept by a registry
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Discriminant of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StateChange,
    Request,
    Success,
    Failure,
    Timeout,
    Fallback,
}

/// Why a caller received a fallback instead of the real result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackReason {
    Open,
    Timeout,
    Error,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::Open => "OPEN",
            FallbackReason::Timeout => "TIMEOUT",
            FallbackReason::Error => "ERROR",
        }
    }
}

/// Per-kind payload of an [`Event`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "eventType",
    content = "details",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EventDetails {
    StateChange {
        from_state: BreakerState,
        to_state: BreakerState,
        reason: String,
    },
    Request {
        state: BreakerState,
    },
    Success {
        duration: u64,
    },
    Failure {
        error: String,
        duration: u64,
    },
    Timeout {
        timeout: u64,
        duration: u64,
    },
    Fallback {
        reason: FallbackReason,
        global: bool,
    },
}

impl EventDetails {
    pub fn event_type(&self) -> EventType {
        match self {
            EventDetails::StateChange { .. } => EventType::StateChange,
            EventDetails::Request { .. } => EventType::Request,
            EventDetails::Success { .. } => EventType::Success,
            EventDetails::Failure { .. } => EventType::Failure,
            EventDetails::Timeout { .. } => EventType::Timeout,
            EventDetails::Fallback { .. } => EventType::Fallback,
        }
    }
}

/// Immutable record of one breaker action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: u64,
    pub service_key: String,
    #[serde(flatten)]
    pub details: EventDetails,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.details.event_type()
    }
}

/// Bounded, append-only event log
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest one when full
    pub fn append(&self, timestamp: u64, service_key: &str, details: EventDetails) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(Event {
            timestamp,
            service_key: service_key.to_string(),
            details,
        });
    }

    /// The `limit` most recent events, optionally for one key, oldest first
    pub fn recent(&self, limit: usize, service_key: Option<&str>) -> Vec<Event> {
        let events = self.events.lock();
        let mut matched: Vec<Event> = events
            .iter()
            .rev()
            .filter(|e| service_key.is_none_or(|key| e.service_key == key))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Events stamped at or after `cutoff_ms`, optionally for one key, oldest first
    pub fn since(&self, cutoff_ms: u64, service_key: Option<&str>) -> Vec<Event> {
        let events = self.events.lock();
        events
            .iter()
            .filter(|e| e.timestamp >= cutoff_ms)
            .filter(|e| service_key.is_none_or(|key| e.service_key == key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
