//! Racing combinators: choose, pick, and the n-ary variants.
//!
//! All of these register a *single* removable waiter shared across every
//! input: the first input to reach a terminal state takes the closure out of
//! the shared cell, which disables the duplicates on the other inputs in one
//! step. The survivors' cleared-cell counters are then scrubbed so their
//! waiter sets eventually compact instead of retaining dead cells.
//!
//! Tie-breaking among inputs that are already terminal uses a deterministic
//! PRNG with a fixed default seed: a program whose scheduling is not driven
//! by external I/O draws the same sequence on every run.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::promise::waiters::{RemovableCell, Waiter, WaiterFn};
use crate::promise::{
    add_waiter, cleanup_removed, complete, new_pending, peek, promise_of_outcome, repr,
    CancelMode, CancelTarget, Outcome, Promise, Wakeup,
};
use crate::util::DetRng;

/// Default seed for the tie-breaking draw.
const CHOICE_SEED: u64 = 0x6C69_6C74;

thread_local! {
    static CHOICE_RNG: RefCell<DetRng> = RefCell::new(DetRng::new(CHOICE_SEED));
}

fn draw(bound: usize) -> usize {
    CHOICE_RNG.with(|rng| rng.borrow_mut().next_usize(bound))
}

/// Indices of the inputs that are already terminal, in input order.
fn terminal_indices<T: Clone + 'static>(ps: &[Promise<T>]) -> Vec<usize> {
    ps.iter()
        .enumerate()
        .filter(|(_, p)| peek(&p.inner).is_some())
        .map(|(i, _)| i)
        .collect()
}

/// Cancel-forward targets for every input.
fn forward_to_all<T: Clone + 'static>(ps: &[Promise<T>]) -> CancelMode {
    CancelMode::forward_many(ps.iter().map(|p| {
        let target: Rc<dyn CancelTarget> = repr(&p.inner);
        target
    }))
}

/// Registers the shared removable closure on every input.
fn watch_all<T: Clone + 'static>(ps: &[Promise<T>], f: WaiterFn<T>) {
    let cell: RemovableCell<T> = Rc::new(RefCell::new(Some(f)));
    for p in ps {
        add_waiter(&p.inner, Waiter::Removable(Rc::clone(&cell)));
    }
}

/// Resolves as the first input to reach a terminal state.
///
/// If several inputs are already terminal, one is picked uniformly at
/// random. The unchosen inputs are not cancelled.
///
/// # Panics
///
/// Panics if `ps` is empty.
#[must_use]
pub fn choose<T: Clone + 'static>(ps: Vec<Promise<T>>) -> Promise<T> {
    assert!(!ps.is_empty(), "choose requires at least one promise");
    let ready = terminal_indices(&ps);
    if !ready.is_empty() {
        let idx = ready[if ready.len() == 1 { 0 } else { draw(ready.len()) }];
        let outcome = peek(&ps[idx].inner).expect("chosen input is terminal");
        return promise_of_outcome(outcome);
    }
    let out = new_pending::<T>(forward_to_all(&ps));
    let out_for_waiter = Rc::clone(&out);
    let inputs = ps.clone();
    watch_all(
        &ps,
        Box::new(move |o: &Outcome<T>| {
            cleanup_removed(&inputs);
            complete(&out_for_waiter, o.clone(), Wakeup::Now);
        }),
    );
    Promise { inner: out }
}

/// Like [`choose`], but cancels every other input once the winner is known.
///
/// # Panics
///
/// Panics if `ps` is empty.
#[must_use]
pub fn pick<T: Clone + 'static>(ps: Vec<Promise<T>>) -> Promise<T> {
    assert!(!ps.is_empty(), "pick requires at least one promise");
    let ready = terminal_indices(&ps);
    if !ready.is_empty() {
        let idx = ready[if ready.len() == 1 { 0 } else { draw(ready.len()) }];
        let outcome = peek(&ps[idx].inner).expect("chosen input is terminal");
        for (i, p) in ps.iter().enumerate() {
            if i != idx {
                p.cancel();
            }
        }
        return promise_of_outcome(outcome);
    }
    let out = new_pending::<T>(forward_to_all(&ps));
    let out_for_waiter = Rc::clone(&out);
    let inputs = ps.clone();
    watch_all(
        &ps,
        Box::new(move |o: &Outcome<T>| {
            cleanup_removed(&inputs);
            for p in &inputs {
                p.cancel(); // the winner is terminal, so this is a no-op on it
            }
            complete(&out_for_waiter, o.clone(), Wakeup::Now);
        }),
    );
    Promise { inner: out }
}

/// Resolved values of the terminal inputs, or the first rejection among
/// them in input order. `None` when no input is terminal.
fn collect_terminal<T: Clone + 'static>(
    ps: &[Promise<T>],
) -> Option<core::result::Result<Vec<T>, Error>> {
    let mut values = Vec::new();
    let mut any = false;
    for p in ps {
        match peek(&p.inner) {
            Some(Outcome::Resolved(v)) => {
                any = true;
                values.push(v);
            }
            Some(Outcome::Rejected(e)) => return Some(Err(e)),
            None => {}
        }
    }
    any.then_some(Ok(values))
}

/// Like [`collect_terminal`], but also returns the still-pending inputs.
#[allow(clippy::type_complexity)]
fn split_terminal<T: Clone + 'static>(
    ps: &[Promise<T>],
) -> Option<core::result::Result<(Vec<T>, Vec<Promise<T>>), Error>> {
    let mut values = Vec::new();
    let mut pending = Vec::new();
    let mut any = false;
    for p in ps {
        match peek(&p.inner) {
            Some(Outcome::Resolved(v)) => {
                any = true;
                values.push(v);
            }
            Some(Outcome::Rejected(e)) => return Some(Err(e)),
            None => pending.push(p.clone()),
        }
    }
    any.then_some(Ok((values, pending)))
}

fn result_outcome<T: 'static>(res: core::result::Result<T, Error>) -> Outcome<T> {
    match res {
        Ok(v) => Outcome::Resolved(v),
        Err(e) => Outcome::Rejected(e),
    }
}

/// Waits until at least one input resolves, then returns the resolved
/// values of every input that is terminal at that instant, in input order.
/// Any rejection rejects the result.
///
/// The first input to reach a terminal state is decisive: a rejection
/// arriving later than an already-collected resolution does not reopen the
/// result.
///
/// # Panics
///
/// Panics if `ps` is empty.
#[must_use]
pub fn nchoose<T: Clone + 'static>(ps: Vec<Promise<T>>) -> Promise<Vec<T>> {
    assert!(!ps.is_empty(), "nchoose requires at least one promise");
    if let Some(res) = collect_terminal(&ps) {
        return promise_of_outcome(result_outcome(res));
    }
    let out = new_pending::<Vec<T>>(forward_to_all(&ps));
    let out_for_waiter = Rc::clone(&out);
    let inputs = ps.clone();
    watch_all(
        &ps,
        Box::new(move |o: &Outcome<T>| {
            cleanup_removed(&inputs);
            let outcome = match o {
                Outcome::Rejected(e) => Outcome::Rejected(e.clone()),
                Outcome::Resolved(_) => {
                    let res = collect_terminal(&inputs).expect("triggering input is terminal");
                    result_outcome(res)
                }
            };
            complete(&out_for_waiter, outcome, Wakeup::Now);
        }),
    );
    Promise { inner: out }
}

/// [`nchoose`] plus cancellation of the remaining inputs once the result is
/// constructed.
///
/// # Panics
///
/// Panics if `ps` is empty.
#[must_use]
pub fn npick<T: Clone + 'static>(ps: Vec<Promise<T>>) -> Promise<Vec<T>> {
    assert!(!ps.is_empty(), "npick requires at least one promise");
    if let Some(res) = collect_terminal(&ps) {
        for p in &ps {
            p.cancel();
        }
        return promise_of_outcome(result_outcome(res));
    }
    let out = new_pending::<Vec<T>>(forward_to_all(&ps));
    let out_for_waiter = Rc::clone(&out);
    let inputs = ps.clone();
    watch_all(
        &ps,
        Box::new(move |o: &Outcome<T>| {
            cleanup_removed(&inputs);
            let outcome = match o {
                Outcome::Rejected(e) => Outcome::Rejected(e.clone()),
                Outcome::Resolved(_) => {
                    let res = collect_terminal(&inputs).expect("triggering input is terminal");
                    result_outcome(res)
                }
            };
            for p in &inputs {
                p.cancel();
            }
            complete(&out_for_waiter, outcome, Wakeup::Now);
        }),
    );
    Promise { inner: out }
}

/// Like [`nchoose`], but additionally returns the inputs still pending at
/// the instant the result was built.
///
/// # Panics
///
/// Panics if `ps` is empty.
#[must_use]
pub fn nchoose_split<T: Clone + 'static>(ps: Vec<Promise<T>>) -> Promise<(Vec<T>, Vec<Promise<T>>)> {
    assert!(!ps.is_empty(), "nchoose_split requires at least one promise");
    if let Some(res) = split_terminal(&ps) {
        return promise_of_outcome(result_outcome(res));
    }
    let out = new_pending::<(Vec<T>, Vec<Promise<T>>)>(forward_to_all(&ps));
    let out_for_waiter = Rc::clone(&out);
    let inputs = ps.clone();
    watch_all(
        &ps,
        Box::new(move |o: &Outcome<T>| {
            cleanup_removed(&inputs);
            let outcome = match o {
                Outcome::Rejected(e) => Outcome::Rejected(e.clone()),
                Outcome::Resolved(_) => {
                    let res = split_terminal(&inputs).expect("triggering input is terminal");
                    result_outcome(res)
                }
            };
            complete(&out_for_waiter, outcome, Wakeup::Now);
        }),
    );
    Promise { inner: out }
}
