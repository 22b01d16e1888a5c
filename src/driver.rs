//! Main driver: the loop that runs a promise to completion.
//!
//! [`run`] alternates between waking paused promises, asking the current
//! reactor for one iteration (blocking only when nothing is already
//! runnable), and draining deferred wakeups, until the root promise reaches
//! a terminal state.
//!
//! Re-entrance is refused: calling `run` from inside a callback that is
//! itself being driven by `run` panics. Exit hooks registered with
//! [`at_exit`] are driven last-registered-first by [`run_exit_hooks`];
//! their rejections and panics are swallowed.

use std::cell::{Cell, RefCell};

use crate::error::{catch_rejection, Result};
use crate::promise::{self, Promise};
use crate::reactor;

thread_local! {
    static RUNNING: Cell<bool> = const { Cell::new(false) };
    static EXIT_HOOKS: RefCell<Vec<Box<dyn FnOnce() -> Promise<()>>>> =
        RefCell::new(Vec::new());
}

struct RunGuard;

impl Drop for RunGuard {
    fn drop(&mut self) {
        RUNNING.with(|r| r.set(false));
    }
}

/// Drives the scheduler until `root` is terminal, then returns its value or
/// rejection.
///
/// Each iteration wakes the paused promises, runs one reactor pass —
/// blocking only when the paused queue is empty and no deferred wakeup is
/// queued — and drains the deferred-wakeup queue.
///
/// A root that nothing (timer, descriptor, pause, or queued wakeup) can
/// ever resolve leaves the driver blocked in the reactor.
///
/// # Panics
///
/// Panics when called re-entrantly from a callback already being driven.
pub fn run<T: Clone + 'static>(root: &Promise<T>) -> Result<T> {
    let reentrant = RUNNING.with(|r| r.replace(true));
    assert!(
        !reentrant,
        "run called from within run: re-entrant driving is not supported"
    );
    let _guard = RunGuard;
    loop {
        match root.poll() {
            Ok(Some(v)) => return Ok(v),
            Err(e) => return Err(e),
            Ok(None) => {}
        }
        promise::wakeup_paused();
        if !root.is_pending() {
            continue;
        }
        let block = promise::paused_count() == 0 && !promise::has_deferred_wakeups();
        reactor::current().iter(block);
        promise::drain_deferred();
    }
}

/// Registers a hook to run before process exit.
pub fn at_exit(hook: impl FnOnce() -> Promise<()> + 'static) {
    EXIT_HOOKS.with(|hooks| hooks.borrow_mut().push(Box::new(hook)));
}

/// Drives the registered exit hooks, last-registered-first.
///
/// Rejections and panics from hooks are logged and swallowed. Call this
/// from the host program before exiting, outside of [`run`].
pub fn run_exit_hooks() {
    loop {
        let hook = EXIT_HOOKS.with(|hooks| hooks.borrow_mut().pop());
        let Some(hook) = hook else { break };
        match catch_rejection(|| run(&hook())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "exit hook rejected; ignored"),
            Err(e) => tracing::debug!(error = %e, "exit hook panicked; ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::promise::pause;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn run_returns_a_terminal_root_immediately() {
        assert_eq!(run(&Promise::resolved(5)).expect("resolved"), 5);
        assert!(run(&Promise::<i32>::rejected(Error::user("x"))).is_err());
    }

    #[test]
    fn run_drives_paused_promises() {
        let p = pause().map(|()| 3);
        assert_eq!(run(&p).expect("resolved"), 3);
    }

    #[test]
    #[should_panic(expected = "re-entrant")]
    fn nested_run_is_refused() {
        let p = pause();
        p.on_success(|()| {
            let _ = run(&Promise::resolved(0));
        });
        let _ = run(&p);
    }

    #[test]
    fn exit_hooks_run_lifo_and_failures_are_swallowed() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        at_exit(move || {
            l.borrow_mut().push("first");
            Promise::resolved(())
        });
        let l = Rc::clone(&log);
        at_exit(move || {
            l.borrow_mut().push("second");
            Promise::rejected(Error::user("hook failed"))
        });
        let l = Rc::clone(&log);
        at_exit(move || {
            l.borrow_mut().push("third");
            panic!("hook panicked")
        });

        run_exit_hooks();
        assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
    }
}
