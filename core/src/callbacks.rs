//! Hooks fired after breaker state transitions

use crate::circuit::BreakerState;
use std::sync::Arc;

/// Hook receiving the service key whose breaker changed state
pub type StateHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Registry-wide transition hooks
///
/// Hooks run synchronously while the breaker is locked; they must not call
/// back into the same breaker.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<StateHook>,
    pub on_close: Option<StateHook>,
    pub on_half_open: Option<StateHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the hook registered for entering `state`
    pub fn trigger(&self, state: BreakerState, service_key: &str) {
        let hook = match state {
            BreakerState::Open => &self.on_open,
            BreakerState::Closed => &self.on_close,
            BreakerState::HalfOpen => &self.on_half_open,
        };
        if let Some(hook) = hook {
            hook(service_key);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_trigger_dispatches_by_state() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let opened = Arc::clone(&seen);
        let closed = Arc::clone(&seen);

        let callbacks = Callbacks {
            on_open: Some(Arc::new(move |key: &str| opened.lock().push(format!("open:{key}")))),
            on_close: Some(Arc::new(move |key: &str| closed.lock().push(format!("close:{key}")))),
            on_half_open: None,
        };

        callbacks.trigger(BreakerState::Open, "a");
        callbacks.trigger(BreakerState::HalfOpen, "a");
        callbacks.trigger(BreakerState::Closed, "b");

        assert_eq!(*seen.lock(), vec!["open:a", "close:b"]);
    }
}
