//! In-flight call accounting
//!
//! Every admitted call holds an [`InFlightGuard`]; dropping the guard
//! releases the slot, so the counter is decremented exactly once even when
//! the guarded future panics or is cancelled by its caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter of calls currently executing through one breaker
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call; the returned guard releases it on drop
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.current.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: Arc::clone(self),
        }
    }

    /// Number of calls currently executing
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn leave(&self) {
        // Saturating: a stray release can never wrap the counter
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Releases one in-flight slot when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_enter_and_release() {
        let in_flight = Arc::new(InFlight::new());

        let first = in_flight.enter();
        let second = in_flight.enter();
        assert_eq!(in_flight.current(), 2);

        drop(first);
        assert_eq!(in_flight.current(), 1);

        drop(second);
        assert_eq!(in_flight.current(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        let in_flight = Arc::new(InFlight::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let counter = Arc::clone(&in_flight);
            handles.push(thread::spawn(move || {
                let _guard = counter.enter();
                thread::sleep(std::time::Duration::from_millis(5));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(in_flight.current(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let in_flight = Arc::new(InFlight::new());

        let counter = Arc::clone(&in_flight);
        let result = std::panic::catch_unwind(move || {
            let _guard = counter.enter();
            panic!("Simulated panic");
        });

        assert!(result.is_err());
        assert_eq!(in_flight.current(), 0);
    }
}
