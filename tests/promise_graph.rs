//! End-to-end behavior of the promise graph: resolution, cancellation
//! propagation, and waiter guarantees.

use std::cell::RefCell;
use std::rc::Rc;

use lilt::test_utils::init_test_logging;
use lilt::{choose, pick, protected, ErrorKind, Promise, PromiseState};

#[test]
fn simple_resolve() {
    init_test_logging();
    let (d, r) = Promise::wait();
    r.resolve(7);
    assert_eq!(d.poll().expect("not rejected"), Some(7));
}

#[test]
fn bind_chain_cancellation_reaches_the_inner_task() {
    init_test_logging();
    lilt::test_phase!("bind_chain_cancellation");

    let (task, _resolver) = Promise::<i32>::task();
    let chained = task.bind(|v| Promise::resolved(v + 1));

    chained.cancel();

    lilt::assert_with_log!(
        matches!(chained.state(), PromiseState::Rejected(ref e) if e.kind() == ErrorKind::Cancelled),
        "chained promise is rejected with Cancelled",
        ErrorKind::Cancelled,
        chained.state()
    );
    lilt::assert_with_log!(
        matches!(task.state(), PromiseState::Rejected(ref e) if e.kind() == ErrorKind::Cancelled),
        "inner task is rejected with Cancelled",
        ErrorKind::Cancelled,
        task.state()
    );
    lilt::test_complete!("bind_chain_cancellation");
}

#[test]
fn pick_cancels_losers_and_resolves_with_the_winner() {
    init_test_logging();
    let (a, resolve_a) = Promise::<i32>::task();
    let (b, _resolve_b) = Promise::<i32>::task();

    let r = pick(vec![a.clone(), b.clone()]);
    resolve_a.resolve(42);

    assert!(matches!(b.state(), PromiseState::Rejected(e) if e.kind() == ErrorKind::Cancelled));
    assert_eq!(r.poll().expect("not rejected"), Some(42));
    assert_eq!(a.poll().expect("not rejected"), Some(42));
}

#[test]
fn terminal_states_are_sticky() {
    init_test_logging();
    let (d, r) = Promise::wait();
    r.resolve(1);

    // Neither cancellation nor repeated observation can change a terminal.
    d.cancel();
    for _ in 0..3 {
        assert!(matches!(d.state(), PromiseState::Resolved(1)));
    }
}

#[test]
fn cancellation_is_delivered_at_most_once() {
    init_test_logging();
    let (d, _r) = Promise::<i32>::task();
    let deliveries = Rc::new(RefCell::new(0));
    let count = Rc::clone(&deliveries);
    d.on_cancel(move || *count.borrow_mut() += 1);

    d.cancel();
    d.cancel();
    d.cancel();
    assert_eq!(*deliveries.borrow(), 1);
}

#[test]
fn cancelling_after_resolution_is_a_silent_no_op() {
    init_test_logging();
    let (d, r) = Promise::wait();
    r.resolve("done");
    d.cancel();
    assert_eq!(d.poll().expect("not rejected"), Some("done"));
}

#[test]
fn each_waiter_fires_exactly_once() {
    init_test_logging();
    let (a, ra) = Promise::<i32>::wait();
    let (b, rb) = Promise::<i32>::task();
    let fired = Rc::new(RefCell::new(0));

    // One removable waiter shared across both inputs of a choose.
    let c = choose(vec![a.clone(), b.clone()]);
    let count = Rc::clone(&fired);
    c.on_termination(move || *count.borrow_mut() += 1);

    ra.resolve(1);
    // The second input resolving later must not re-fire the choose.
    rb.resolve(2);
    assert_eq!(*fired.borrow(), 1);
    assert_eq!(c.poll().expect("not rejected"), Some(1));
}

#[test]
fn protected_shields_the_original_from_cancellation() {
    init_test_logging();
    let (d, r) = Promise::<i32>::task();
    let copy = protected(&d);

    copy.cancel();
    assert!(matches!(copy.state(), PromiseState::Rejected(e) if e.kind() == ErrorKind::Cancelled));
    assert!(d.is_pending());

    r.resolve(9);
    assert_eq!(d.poll().expect("not rejected"), Some(9));
}

#[test]
fn many_cleared_waiters_do_not_disturb_live_ones() {
    init_test_logging();
    let (long_lived, r) = Promise::<i32>::wait();
    let fired = Rc::new(RefCell::new(0));

    // Each round registers a shared removable waiter on `long_lived` and
    // immediately clears it by resolving the other input; enough rounds
    // push the set past the compaction threshold.
    for _ in 0..100 {
        let (other, resolve_other) = Promise::<i32>::wait();
        let c = choose(vec![long_lived.clone(), other]);
        resolve_other.resolve(0);
        assert_eq!(c.poll().expect("not rejected"), Some(0));
    }

    let count = Rc::clone(&fired);
    long_lived.on_success(move |_| *count.borrow_mut() += 1);
    r.resolve(5);
    assert_eq!(*fired.borrow(), 1);
    assert_eq!(long_lived.poll().expect("not rejected"), Some(5));
}

#[test]
fn resolve_later_unwinds_before_waiters_run() {
    init_test_logging();
    let depth = Rc::new(RefCell::new(0u32));
    let max_depth = Rc::new(RefCell::new(0u32));

    // Build a chain where each waiter resolves the next promise with the
    // deferred flavour; the observed nesting depth must stay flat.
    let (first, r) = Promise::<i32>::wait();
    let mut current = first.clone();
    for _ in 0..1000 {
        let (next, resolve_next) = Promise::<i32>::wait();
        let depth = Rc::clone(&depth);
        let max_depth = Rc::clone(&max_depth);
        let resolve_next = RefCell::new(Some(resolve_next));
        current.on_success(move |v| {
            *depth.borrow_mut() += 1;
            let here = *depth.borrow();
            if here > *max_depth.borrow() {
                *max_depth.borrow_mut() = here;
            }
            if let Some(resolver) = resolve_next.borrow_mut().take() {
                resolver.resolve_later(*v + 1);
            }
            *depth.borrow_mut() -= 1;
        });
        current = next;
    }

    r.resolve(0);
    assert_eq!(current.poll().expect("not rejected"), Some(1000));
    assert_eq!(*max_depth.borrow(), 1, "deferred wakeups must not nest");
}
