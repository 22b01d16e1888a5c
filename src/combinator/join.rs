//! The join combinator: wait for every input.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::promise::waiters::Waiter;
use crate::promise::{
    add_waiter, complete, new_pending, peek, repr, CancelMode, CancelTarget, Outcome, Promise,
    Wakeup,
};

struct JoinState {
    remaining: usize,
    first_failure: Option<Error>,
}

/// Waits for every input. Resolves with `()` when all inputs resolved;
/// otherwise rejects with the first rejection *in arrival order* — a later
/// listed input that fails earlier in time wins.
///
/// The result always waits for every input, even after a failure, so that
/// no input is abandoned mid-flight. Cancelling the result cancels every
/// still-pending input.
#[must_use]
pub fn join(ps: Vec<Promise<()>>) -> Promise<()> {
    let mut first_failure: Option<Error> = None;
    let mut pending: Vec<Promise<()>> = Vec::new();
    for p in ps {
        match peek(&p.inner) {
            Some(Outcome::Resolved(())) => {}
            Some(Outcome::Rejected(e)) => {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
            None => pending.push(p),
        }
    }
    if pending.is_empty() {
        return match first_failure {
            Some(e) => Promise::rejected(e),
            None => Promise::resolved(()),
        };
    }

    let out = new_pending::<()>(CancelMode::forward_many(pending.iter().map(|p| {
        let target: Rc<dyn CancelTarget> = repr(&p.inner);
        target
    })));
    let state = Rc::new(RefCell::new(JoinState {
        remaining: pending.len(),
        first_failure,
    }));
    for p in &pending {
        let state = Rc::clone(&state);
        let out_for_waiter = Rc::clone(&out);
        add_waiter(
            &p.inner,
            Waiter::Permanent(Box::new(move |o: &Outcome<()>| {
                let finished = {
                    let mut st = state.borrow_mut();
                    if let Outcome::Rejected(e) = o {
                        if st.first_failure.is_none() {
                            st.first_failure = Some(e.clone());
                        }
                    }
                    st.remaining -= 1;
                    if st.remaining == 0 {
                        Some(st.first_failure.take())
                    } else {
                        None
                    }
                };
                if let Some(failure) = finished {
                    let outcome = match failure {
                        Some(e) => Outcome::Rejected(e),
                        None => Outcome::Resolved(()),
                    };
                    complete(&out_for_waiter, outcome, Wakeup::Now);
                }
            })),
        );
    }
    Promise { inner: out }
}
