//! Driver-level behavior: pausing, dynamic context across suspension
//! points, and constant-space tail loops.

use lilt::test_utils::init_test_logging;
use lilt::{new_key, pause, paused_count, run, wakeup_paused, Promise};

#[test]
fn dynamic_key_scoping_survives_a_pause_inside_bind() {
    init_test_logging();
    lilt::test_phase!("dynamic_key_scoping");

    let k = new_key::<String>();
    let key = k.clone();
    let p = k.with_value(Some("x".to_string()), || {
        pause().bind(move |()| Promise::resolved(key.get()))
    });

    // Outside the scope the key reads nothing...
    assert_eq!(k.get(), None);
    // ...but the bind resumed under the captured context.
    let result = run(&p).expect("driver result");
    assert_eq!(result, Some("x".to_string()));
    assert_eq!(k.get(), None);
    lilt::test_complete!("dynamic_key_scoping");
}

#[test]
fn context_is_restored_around_every_waiter_firing() {
    init_test_logging();
    let k = new_key::<i32>();

    let key = k.clone();
    let observed_inside = k.with_value(Some(1), || pause().map(move |()| key.get()));
    let key = k.clone();
    let observed_outside = pause().map(move |()| key.get());

    wakeup_paused();
    assert_eq!(
        observed_inside.poll().expect("not rejected"),
        Some(Some(1))
    );
    assert_eq!(
        observed_outside.poll().expect("not rejected"),
        Some(None)
    );
    assert_eq!(k.get(), None);
}

#[test]
fn tail_recursive_pause_loop_runs_in_constant_space() {
    init_test_logging();
    lilt::test_phase!("tail_recursive_pause_loop");

    fn step(n: u32) -> Promise<u32> {
        if n == 0 {
            Promise::resolved(0)
        } else {
            pause().bind(move |()| step(n - 1))
        }
    }

    let p = step(1_000_000);
    let result = run(&p).expect("driver result");
    assert_eq!(result, 0);
    assert_eq!(paused_count(), 0);
    lilt::test_complete!("tail_recursive_pause_loop");
}

#[test]
fn paused_promises_resolve_once_per_driver_iteration() {
    init_test_logging();

    // Two sequential pauses need two driver iterations; both complete.
    let p = pause().bind(|()| pause()).map(|()| "done");
    assert_eq!(run(&p).expect("driver result"), "done");
}

#[test]
fn run_reports_rejection_of_the_root() {
    init_test_logging();
    let p = pause().bind(|()| Promise::<i32>::rejected(lilt::Error::user("root failed")));
    let err = run(&p).expect_err("rejected root");
    assert_eq!(err.to_string(), "user error: root failed");
}

#[test]
fn run_can_be_called_again_after_finishing() {
    init_test_logging();
    assert_eq!(run(&pause().map(|()| 1)).expect("first"), 1);
    assert_eq!(run(&pause().map(|()| 2)).expect("second"), 2);
}
