//! Min-heap of callback timers shared by both reactor implementations.
//!
//! Entries are ordered by `(deadline, generation)`; the generation counter
//! breaks ties in insertion order. Stopped timers are not removed eagerly —
//! their handle's flag is checked when they surface, and they are dropped
//! then.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::{Callback, EventHandle};
use crate::error::catch_rejection;

/// Fires every live timer due by now, in deadline order, re-queueing
/// repeating ones. Panicking callbacks are isolated and logged.
pub(crate) fn fire_due(timers: &RefCell<TimerHeap>) {
    loop {
        let entry = timers.borrow_mut().pop_due(Instant::now());
        let Some(entry) = entry else { break };
        let callback = Rc::clone(&entry.callback);
        let handle = entry.handle.clone();
        if let Err(e) = catch_rejection(|| (callback.borrow_mut())(&handle)) {
            tracing::error!(error = %e, "timer callback panicked; continuing iteration");
        }
        if entry.repeat && entry.handle.is_active() {
            timers.borrow_mut().reschedule(entry, Instant::now());
        }
    }
}

/// A timer created outside an iteration, waiting to enter the heap.
///
/// The creation instant is kept so that staging does not shift the deadline.
pub(crate) struct StagedTimer {
    pub(crate) created: Instant,
    pub(crate) period: Duration,
    pub(crate) repeat: bool,
    pub(crate) callback: Callback,
    pub(crate) handle: EventHandle,
}

pub(crate) struct TimerEntry {
    deadline: Instant,
    generation: u64,
    pub(crate) period: Duration,
    pub(crate) repeat: bool,
    pub(crate) callback: Callback,
    pub(crate) handle: EventHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a timer with an absolute deadline.
    pub(crate) fn insert(
        &mut self,
        deadline: Instant,
        period: Duration,
        repeat: bool,
        callback: Callback,
        handle: EventHandle,
    ) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            generation,
            period,
            repeat,
            callback,
            handle,
        });
    }

    /// Moves staged timers into the heap, keeping their original deadlines.
    pub(crate) fn absorb(&mut self, staged: Vec<StagedTimer>) {
        for timer in staged {
            if !timer.handle.is_active() {
                continue;
            }
            self.insert(
                timer.created + timer.period,
                timer.period,
                timer.repeat,
                timer.callback,
                timer.handle,
            );
        }
    }

    /// Re-queues a repeating timer one period after `now`.
    pub(crate) fn reschedule(&mut self, entry: TimerEntry, now: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline: now + entry.period,
            generation,
            ..entry
        });
    }

    /// The earliest live deadline. Stopped heads are discarded on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let stopped_head = self
                .heap
                .peek()
                .is_some_and(|entry| !entry.handle.is_active());
            if stopped_head {
                self.heap.pop();
                continue;
            }
            return self.heap.peek().map(|entry| entry.deadline);
        }
    }

    /// Pops the next live entry due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry");
            if entry.handle.is_active() {
                return Some(entry);
            }
        }
        None
    }

    /// Removes and returns every entry, live or not, in no particular order.
    pub(crate) fn drain(&mut self) -> Vec<TimerEntry> {
        std::mem::take(&mut self.heap).into_vec()
    }

    /// Number of live timers.
    pub(crate) fn active_count(&self) -> usize {
        self.heap
            .iter()
            .filter(|entry| entry.handle.is_active())
            .count()
    }
}
