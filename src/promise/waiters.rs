//! Waiter sets: the continuations registered against a pending promise.
//!
//! A waiter set is a lazily flattened tree with O(1) append and O(1) merge
//! (merging happens when a pending promise is forwarded onto another). A
//! waiter is either *permanent* — always runs on resolution — or *removable*,
//! indirected through a one-slot cell that multi-way combinators clear after
//! their first input fires. Cleared cells are left in place and skipped;
//! once a promise has accumulated more than [`CLEANUP_THROTTLE`] of them, a
//! single traversal compacts the set.

use std::cell::RefCell;
use std::rc::Rc;

use super::Outcome;

/// Cleared-cell count above which a waiter set is compacted.
pub(crate) const CLEANUP_THROTTLE: u32 = 42;

/// A continuation fired with the promise's terminal outcome.
pub(crate) type WaiterFn<T> = Box<dyn FnOnce(&Outcome<T>)>;

/// The one-slot cell behind a removable waiter.
///
/// The same cell is registered on every input of a multi-way combinator;
/// taking the closure out disables all the duplicates at once.
pub(crate) type RemovableCell<T> = Rc<RefCell<Option<WaiterFn<T>>>>;

pub(crate) enum Waiter<T> {
    Permanent(WaiterFn<T>),
    Removable(RemovableCell<T>),
}

impl<T> Waiter<T> {
    /// Creates a removable waiter and the cell that clears it.
    pub(crate) fn removable(f: WaiterFn<T>) -> (Self, RemovableCell<T>) {
        let cell: RemovableCell<T> = Rc::new(RefCell::new(Some(f)));
        (Self::Removable(Rc::clone(&cell)), cell)
    }

    /// Runs the waiter. Removable waiters whose cell was cleared are skipped.
    pub(crate) fn invoke(self, outcome: &Outcome<T>) {
        match self {
            Self::Permanent(f) => f(outcome),
            Self::Removable(cell) => {
                let f = cell.borrow_mut().take();
                if let Some(f) = f {
                    f(outcome);
                }
            }
        }
    }

    fn is_cleared(&self) -> bool {
        match self {
            Self::Permanent(_) => false,
            Self::Removable(cell) => cell.borrow().is_none(),
        }
    }
}

pub(crate) enum WaiterSet<T> {
    Empty,
    One(Waiter<T>),
    Concat(Box<WaiterSet<T>>, Box<WaiterSet<T>>),
}

impl<T> Default for WaiterSet<T> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<T> WaiterSet<T> {
    /// Appends a waiter after all existing ones. O(1).
    pub(crate) fn append(&mut self, waiter: Waiter<T>) {
        let old = std::mem::take(self);
        *self = match old {
            Self::Empty => Self::One(waiter),
            set => Self::Concat(Box::new(set), Box::new(Self::One(waiter))),
        };
    }

    /// Appends all of `other`'s waiters after this set's. O(1).
    pub(crate) fn merge(&mut self, other: Self) {
        if matches!(other, Self::Empty) {
            return;
        }
        let old = std::mem::take(self);
        *self = match old {
            Self::Empty => other,
            set => Self::Concat(Box::new(set), Box::new(other)),
        };
    }

    /// Fires every waiter in registration order.
    pub(crate) fn fire(self, outcome: &Outcome<T>) {
        let mut stack = vec![self];
        while let Some(set) = stack.pop() {
            match set {
                Self::Empty => {}
                Self::One(w) => w.invoke(outcome),
                Self::Concat(a, b) => {
                    stack.push(*b);
                    stack.push(*a);
                }
            }
        }
    }

    /// Rebuilds the set, dropping removable waiters whose cell was cleared.
    pub(crate) fn compact(&mut self) {
        let old = std::mem::take(self);
        let mut stack = vec![old];
        while let Some(set) = stack.pop() {
            match set {
                Self::Empty => {}
                Self::One(w) => {
                    if !w.is_cleared() {
                        self.append(w);
                    }
                }
                Self::Concat(a, b) => {
                    stack.push(*b);
                    stack.push(*a);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn log_waiter(log: &Rc<RefCell<Vec<u32>>>, tag: u32) -> WaiterFn<i32> {
        let log = Rc::clone(log);
        Box::new(move |_| log.borrow_mut().push(tag))
    }

    #[test]
    fn fires_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = WaiterSet::Empty;
        for tag in 0..5 {
            set.append(Waiter::Permanent(log_waiter(&log, tag)));
        }
        set.fire(&Outcome::Resolved(0));
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn merge_appends_after_existing() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut a = WaiterSet::Empty;
        a.append(Waiter::Permanent(log_waiter(&log, 1)));
        let mut b = WaiterSet::Empty;
        b.append(Waiter::Permanent(log_waiter(&log, 2)));
        a.merge(b);
        a.fire(&Outcome::Resolved(0));
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn cleared_removable_does_not_fire() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (waiter, cell) = Waiter::removable(log_waiter(&log, 7));
        let mut set = WaiterSet::Empty;
        set.append(waiter);
        cell.borrow_mut().take();
        set.fire(&Outcome::Resolved(0));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn shared_cell_fires_at_most_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (waiter, cell) = Waiter::removable(log_waiter(&log, 7));
        let mut set = WaiterSet::Empty;
        set.append(waiter);
        set.append(Waiter::Removable(cell));
        set.fire(&Outcome::Resolved(0));
        assert_eq!(*log.borrow(), vec![7]);
    }

    #[test]
    fn compact_drops_only_cleared_cells() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = WaiterSet::Empty;
        let (live, _live_cell) = Waiter::removable(log_waiter(&log, 1));
        let (dead, dead_cell) = Waiter::removable(log_waiter(&log, 2));
        set.append(live);
        set.append(dead);
        set.append(Waiter::Permanent(log_waiter(&log, 3)));
        dead_cell.borrow_mut().take();

        set.compact();
        set.fire(&Outcome::Resolved(0));
        assert_eq!(*log.borrow(), vec![1, 3]);
    }
}
