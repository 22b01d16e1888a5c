//! Algebraic laws of the combinators and the pinned racing semantics.

use std::cell::RefCell;
use std::rc::Rc;

use lilt::test_utils::init_test_logging;
use lilt::{catch, choose, finalize, join, nchoose, nchoose_split, Error, ErrorKind, Promise,
    PromiseState};

fn value_of<T: Clone + 'static>(p: &Promise<T>) -> T {
    p.poll().expect("not rejected").expect("resolved")
}

#[test]
fn bind_left_identity() {
    init_test_logging();
    let f = |v: i32| Promise::resolved(v * 2);
    let lhs = Promise::resolved(21).bind(f);
    let rhs = f(21);
    assert_eq!(value_of(&lhs), value_of(&rhs));
}

#[test]
fn bind_right_identity() {
    init_test_logging();
    let (d, r) = Promise::<i32>::wait();
    let bound = d.bind(Promise::resolved);
    r.resolve(17);
    assert_eq!(value_of(&bound), value_of(&d));
}

#[test]
fn bind_associativity() {
    init_test_logging();
    let f = |v: i32| Promise::resolved(v + 1);
    let g = |v: i32| Promise::resolved(v * 3);

    let (d1, r1) = Promise::<i32>::wait();
    let lhs = d1.bind(f).bind(g);
    let (d2, r2) = Promise::<i32>::wait();
    let rhs = d2.bind(move |x| f(x).bind(g));

    r1.resolve(5);
    r2.resolve(5);
    assert_eq!(value_of(&lhs), value_of(&rhs));
}

#[test]
fn catch_laws() {
    init_test_logging();
    let handled = catch(
        || Promise::<i32>::rejected(Error::user("boom")),
        |e| Promise::resolved(i32::from(e.kind() == ErrorKind::User)),
    );
    assert_eq!(value_of(&handled), 1);

    let untouched = catch(|| Promise::resolved(5), |_| Promise::resolved(0));
    assert_eq!(value_of(&untouched), 5);
}

#[test]
fn finalize_runs_cleanup_exactly_once_either_way() {
    init_test_logging();
    let runs = Rc::new(RefCell::new(0));

    let counter = Rc::clone(&runs);
    let ok = finalize(
        || Promise::resolved(1),
        move || {
            *counter.borrow_mut() += 1;
            Promise::resolved(())
        },
    );
    assert_eq!(value_of(&ok), 1);

    let counter = Rc::clone(&runs);
    let err: Promise<i32> = finalize(
        || Promise::rejected(Error::user("x")),
        move || {
            *counter.borrow_mut() += 1;
            Promise::resolved(())
        },
    );
    assert!(err.is_rejected());
    assert_eq!(*runs.borrow(), 2);
}

#[test]
fn join_with_failure_rejects_once_every_input_is_settled() {
    init_test_logging();
    lilt::test_phase!("join_with_failure");

    let (pending_task, resolver) = Promise::<()>::task();
    let j = join(vec![
        Promise::resolved(()),
        Promise::rejected(Error::user("E")),
        pending_task,
    ]);

    // The failure is already known, but join still waits for the last input.
    assert!(j.is_pending());
    resolver.resolve(());

    lilt::assert_with_log!(
        matches!(j.state(), PromiseState::Rejected(ref e) if e.kind() == ErrorKind::User),
        "join rejects with the original failure",
        ErrorKind::User,
        j.state()
    );
    lilt::test_complete!("join_with_failure");
}

#[test]
fn choose_tie_break_is_deterministic_and_roughly_uniform() {
    init_test_logging();

    // Two fresh scheduler threads draw the same 1000-element sequence from
    // the fixed default seed.
    fn draw_sequence() -> Vec<i32> {
        (0..1000)
            .map(|_| {
                let c = choose(vec![
                    Promise::resolved(1),
                    Promise::resolved(2),
                    Promise::resolved(3),
                ]);
                c.poll().expect("not rejected").expect("resolved")
            })
            .collect()
    }

    let first = std::thread::spawn(draw_sequence).join().expect("thread");
    let second = std::thread::spawn(draw_sequence).join().expect("thread");
    assert_eq!(first, second, "tie-break sequence must be reproducible");

    let mut counts = [0usize; 3];
    for v in &first {
        counts[usize::try_from(*v).expect("positive") - 1] += 1;
    }
    for count in counts {
        assert!(
            (200..=500).contains(&count),
            "tie-break badly skewed: {counts:?}"
        );
    }
}

#[test]
fn nchoose_first_terminal_is_decisive() {
    init_test_logging();
    let (a, ra) = Promise::<i32>::wait();
    let (b, rb) = Promise::<i32>::wait();
    let n = nchoose(vec![a, b]);

    ra.resolve(1);
    assert_eq!(value_of(&n), vec![1]);

    // A rejection after the result was built does not reopen it.
    rb.reject(Error::user("late"));
    assert_eq!(value_of(&n), vec![1]);
}

#[test]
fn nchoose_rejects_when_a_rejection_is_in_the_terminal_set() {
    init_test_logging();

    // At call time: the rejection wins even with a resolution present.
    let n = nchoose(vec![
        Promise::resolved(1),
        Promise::<i32>::rejected(Error::user("called")),
    ]);
    assert!(matches!(n.state(), PromiseState::Rejected(e) if e.kind() == ErrorKind::User));

    // While waiting: the first terminal being a rejection rejects.
    let (a, ra) = Promise::<i32>::wait();
    let (b, _rb) = Promise::<i32>::wait();
    let n = nchoose(vec![a, b]);
    ra.reject(Error::user("waited"));
    assert!(matches!(n.state(), PromiseState::Rejected(e) if e.kind() == ErrorKind::User));
}

#[test]
fn nchoose_split_hands_back_the_pending_inputs() {
    init_test_logging();
    let (a, ra) = Promise::<i32>::wait();
    let (b, rb) = Promise::<i32>::wait();
    let (c, _rc) = Promise::<i32>::wait();
    let n = nchoose_split(vec![a, b, c]);

    ra.resolve(10);
    let (values, rest) = value_of(&n);
    assert_eq!(values, vec![10]);
    assert_eq!(rest.len(), 2);

    rb.resolve(20);
    assert_eq!(rest[0].poll().expect("not rejected"), Some(20));
    assert!(rest[1].is_pending());
}

#[test]
fn rejections_propagate_without_extra_guards() {
    init_test_logging();
    // A panic deep in a user callback surfaces as a rejection at the end of
    // the chain, not as an unwind.
    let (d, r) = Promise::<i32>::wait();
    let p = d
        .bind(|v| Promise::resolved(v + 1))
        .map(|_| -> i32 { panic!("deep panic") })
        .bind(|v| Promise::resolved(v));
    r.resolve(0);
    assert!(matches!(p.state(), PromiseState::Rejected(e) if e.kind() == ErrorKind::Panicked));
}
