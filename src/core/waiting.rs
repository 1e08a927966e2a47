//! Waiting counters.
//!
//! A waiting counter tracks how many delayed operations an entity currently has in flight; the
//! count at admission time scales the synthetic processing delay of that operation. The only way
//! to raise the count is [`WaitingCounter::enter`], which hands back a [`WaitingGuard`]; the only
//! way to lower it is dropping that guard. Scheduled events own their guard, so whether an event
//! fires or gets cancelled the count comes back down exactly once.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use time::Duration;

/// A shared count of in-flight delayed operations.
#[derive(Debug, Clone, Default)]
pub struct WaitingCounter {
    count: Arc<AtomicUsize>,
}

impl WaitingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight operation and returns its ticket.
    pub fn enter(&self) -> WaitingGuard {
        let position = self.count.fetch_add(1, Ordering::AcqRel) + 1;

        WaitingGuard {
            count: Arc::clone(&self.count),
            position,
        }
    }

    /// Returns the number of operations currently in flight.
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.get() == 0
    }
}

/// Ticket for one in-flight operation; dropping it releases the slot.
#[must_use = "dropping the guard immediately releases the waiting slot"]
pub struct WaitingGuard {
    count: Arc<AtomicUsize>,
    position: usize,
}

impl WaitingGuard {
    /// The counter value right after this operation was admitted (1-based).
    pub fn position(&self) -> usize {
        self.position
    }

    /// The modeled serialization delay of this operation: `cost × position`.
    pub fn delay(&self, cost: Duration) -> Duration {
        cost * self.position as u32
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        // Guards are only minted by `enter`, the count can't already be zero.
        debug_assert_ne!(previous, 0);
    }
}

impl fmt::Debug for WaitingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingGuard")
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_release() {
        let counter = WaitingCounter::new();
        assert!(counter.is_idle());

        let a = counter.enter();
        let b = counter.enter();
        assert_eq!(a.position(), 1);
        assert_eq!(b.position(), 2);
        assert_eq!(counter.get(), 2);

        drop(a);
        assert_eq!(counter.get(), 1);

        // The next admission sees the current load, not the historical maximum.
        let c = counter.enter();
        assert_eq!(c.position(), 2);

        drop(b);
        drop(c);
        assert!(counter.is_idle());
    }

    #[test]
    fn delay_scales_with_position() {
        let counter = WaitingCounter::new();
        let cost = Duration::microseconds(40);

        let guards: Vec<_> = (0..10).map(|_| counter.enter()).collect();
        for (i, guard) in guards.iter().enumerate() {
            assert_eq!(guard.delay(cost), cost * (i as u32 + 1));
        }

        drop(guards);
        assert!(counter.is_idle());
    }

    #[test]
    fn clones_share_the_count() {
        let counter = WaitingCounter::new();
        let clone = counter.clone();

        let _guard = clone.enter();
        assert_eq!(counter.get(), 1);
    }
}
