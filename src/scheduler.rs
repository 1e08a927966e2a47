//! Scheduler implementations.
//!
//! [`SimScheduler`] is a deterministic discrete-event queue: events fire in `(time, sequence)`
//! order and the clock only moves when an event is popped. `TokioScheduler` (behind the `sync`
//! feature) runs the same events on wall-clock timers.
//!
//! Both keep pending events to themselves until they fire, so a cancelled event, and any ticket
//! it carries, is dropped by `cancel` itself.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
};

use crate::core::{
    clock::{non_negative, Duration, Timestamp},
    traits::{EventId, Scheduler},
};

/// Heap key of a pending event; the payload lives in a side table so it can be dropped on
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    at: Timestamp,
    id: EventId,
}

// Reversed so the max-heap pops the earliest slot, ids break ties in scheduling order.
impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.at.cmp(&self.at) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An event handed back by [`SimScheduler::pop`].
#[derive(Debug)]
pub struct Fired<E> {
    pub at: Timestamp,
    pub id: EventId,
    pub event: E,
}

/// A deterministic discrete-event scheduler.
#[derive(Debug)]
pub struct SimScheduler<E> {
    now: Timestamp,
    next_id: u64,
    queue: BinaryHeap<Slot>,
    pending: HashMap<EventId, E>,
}

impl<E> Default for SimScheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> SimScheduler<E> {
    pub fn new() -> Self {
        Self::starting_at(Timestamp::ZERO)
    }

    /// Creates a scheduler whose clock starts at `now`.
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            now,
            next_id: 0,
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// The number of pending events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the fire time of the next pending event.
    pub fn peek_time(&mut self) -> Option<Timestamp> {
        self.skip_cancelled();
        self.queue.peek().map(|slot| slot.at)
    }

    /// Removes the next event and advances the clock to its fire time.
    pub fn pop(&mut self) -> Option<Fired<E>> {
        while let Some(slot) = self.queue.pop() {
            if let Some(event) = self.pending.remove(&slot.id) {
                debug_assert!(slot.at >= self.now);
                self.now = slot.at;

                return Some(Fired {
                    at: slot.at,
                    id: slot.id,
                    event,
                });
            }
        }

        None
    }

    /// Fires every event due at or before `deadline`, then moves the clock to `deadline`.
    ///
    /// The handler gets the scheduler back so it can schedule follow-up events; those fire in
    /// the same run if they are due in time. Returns the number of events fired.
    pub fn run_until<F>(&mut self, deadline: Timestamp, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, Fired<E>),
    {
        let mut fired = 0;

        while matches!(self.peek_time(), Some(at) if at <= deadline) {
            if let Some(event) = self.pop() {
                handler(self, event);
                fired += 1;
            }
        }

        if deadline > self.now {
            self.now = deadline;
        }

        fired
    }

    /// Fires events until none are left. Returns the number of events fired.
    pub fn run<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, Fired<E>),
    {
        let mut fired = 0;

        while let Some(event) = self.pop() {
            handler(self, event);
            fired += 1;
        }

        fired
    }

    fn skip_cancelled(&mut self) {
        while let Some(slot) = self.queue.peek() {
            if self.pending.contains_key(&slot.id) {
                break;
            }
            self.queue.pop();
        }
    }
}

impl<E> Scheduler<E> for SimScheduler<E> {
    fn now(&self) -> Timestamp {
        self.now
    }

    fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;

        let at = self.now + non_negative(delay);
        self.queue.push(Slot { at, id });
        self.pending.insert(id, event);

        id
    }

    fn cancel(&mut self, id: EventId) -> bool {
        // The heap slot is skipped lazily, the event itself is dropped here.
        self.pending.remove(&id).is_some()
    }
}

#[cfg(feature = "sync")]
mod tokio_scheduler {
    use std::{collections::HashMap, time::Instant};

    use tokio::{
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        task::JoinHandle,
    };

    use crate::core::{
        clock::{non_negative, Duration, Timestamp},
        traits::{EventId, Scheduler},
    };

    /// A wall-clock scheduler running a sleeping tokio task per pending event.
    ///
    /// Must be used from within a tokio runtime. The events stay in the scheduler, timers only
    /// send their id back once they elapse, so cancelling drops the event on the spot even if
    /// its timer already went off.
    #[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
    #[derive(Debug)]
    pub struct TokioScheduler<E> {
        start: Instant,
        next_id: u64,
        tx: UnboundedSender<EventId>,
        rx: UnboundedReceiver<EventId>,
        pending: HashMap<EventId, (E, JoinHandle<()>)>,
    }

    impl<E> Default for TokioScheduler<E> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<E> TokioScheduler<E> {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();

            Self {
                start: Instant::now(),
                next_id: 0,
                tx,
                rx,
                pending: HashMap::new(),
            }
        }

        /// The number of events that have not been handed out yet.
        pub fn len(&self) -> usize {
            self.pending.len()
        }

        pub fn is_empty(&self) -> bool {
            self.pending.is_empty()
        }

        /// Waits for the next event to fire, returns `None` when nothing is pending.
        pub async fn next(&mut self) -> Option<(EventId, E)> {
            while !self.pending.is_empty() {
                let id = self.rx.recv().await?;

                // Ids of cancelled events can still arrive, there is nothing left to hand out.
                if let Some((event, _)) = self.pending.remove(&id) {
                    return Some((id, event));
                }
            }

            None
        }
    }

    impl<E> Scheduler<E> for TokioScheduler<E> {
        fn now(&self) -> Timestamp {
            let elapsed = Duration::try_from(self.start.elapsed()).unwrap_or(Duration::MAX);
            Timestamp::from_offset(elapsed)
        }

        fn schedule(&mut self, delay: Duration, event: E) -> EventId {
            let id = EventId(self.next_id);
            self.next_id += 1;

            let delay = std::time::Duration::try_from(non_negative(delay)).unwrap_or_default();
            let tx = self.tx.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // The receiver lives as long as the scheduler.
                let _ = tx.send(id);
            });
            self.pending.insert(id, (event, task));

            id
        }

        fn cancel(&mut self, id: EventId) -> bool {
            match self.pending.remove(&id) {
                Some((event, task)) => {
                    task.abort();
                    drop(event);
                    true
                }
                None => false,
            }
        }
    }

}

#[cfg(feature = "sync")]
pub use tokio_scheduler::TokioScheduler;
