//! Sequencing combinators: bind, map, catch, try_bind, finalize.
//!
//! # Algebraic Laws
//!
//! - `resolved(v).bind(f) ≡ f(v)`
//! - `d.bind(Promise::resolved) ≡ d` (up to sharing)
//! - `d.bind(f).bind(g) ≡ d.bind(|x| f(x).bind(g))`
//! - `catch(|| rejected(e), g) ≡ g(e)`; `catch(|| resolved(v), g) ≡
//!   resolved(v)`
//! - `finalize(f, g)` runs `g` exactly once, after `f`'s outcome is known.
//!
//! Cancellation propagates backwards through every combinator here: the
//! result shares its antecedent's cancel handle until the user function
//! produces a new promise, at which point the handle is retargeted to that
//! promise's.

use std::rc::Rc;

use crate::error::{catch_rejection, Error};
use crate::promise::waiters::Waiter;
use crate::promise::{
    add_waiter, complete, connect, new_pending, peek, promise_of_outcome, repr, CancelMode,
    CancelTarget, Outcome, Promise, Wakeup,
};
use crate::storage;

impl<T: Clone + 'static> Promise<T> {
    /// Waits on `self`; on resolution, forwards to the promise produced by
    /// `f`; on rejection, rejects with the same error.
    ///
    /// Cancelling the result propagates through to `self` (and, once `f` has
    /// run, to the promise it returned).
    pub fn bind<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        let rep = repr(&self.inner);
        match peek(&rep) {
            Some(Outcome::Resolved(v)) => match catch_rejection(|| f(v)) {
                Ok(p) => p,
                Err(e) => Promise::rejected(e),
            },
            Some(Outcome::Rejected(e)) => Promise::rejected(e),
            None => {
                let snap = storage::snapshot();
                let out = new_pending::<U>(CancelMode::forward_one(Rc::clone(&rep) as Rc<dyn CancelTarget>));
                let out_for_waiter = Rc::clone(&out);
                add_waiter(
                    &rep,
                    Waiter::Permanent(Box::new(move |o: &Outcome<T>| match o {
                        Outcome::Resolved(v) => {
                            let v = v.clone();
                            match storage::with_snapshot(&snap, || catch_rejection(|| f(v))) {
                                Ok(p) => connect(&out_for_waiter, &p),
                                Err(e) => {
                                    complete(&out_for_waiter, Outcome::Rejected(e), Wakeup::Now);
                                }
                            }
                        }
                        Outcome::Rejected(e) => {
                            complete(&out_for_waiter, Outcome::Rejected(e.clone()), Wakeup::Now);
                        }
                    })),
                );
                Promise { inner: out }
            }
        }
    }

    /// Like `bind` with a plain function: resolves with `f(v)`. A panic in
    /// `f` becomes a rejection.
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let rep = repr(&self.inner);
        match peek(&rep) {
            Some(Outcome::Resolved(v)) => match catch_rejection(|| f(v)) {
                Ok(u) => Promise::resolved(u),
                Err(e) => Promise::rejected(e),
            },
            Some(Outcome::Rejected(e)) => Promise::rejected(e),
            None => {
                let snap = storage::snapshot();
                let out = new_pending::<U>(CancelMode::forward_one(Rc::clone(&rep) as Rc<dyn CancelTarget>));
                let out_for_waiter = Rc::clone(&out);
                add_waiter(
                    &rep,
                    Waiter::Permanent(Box::new(move |o: &Outcome<T>| {
                        let outcome = match o {
                            Outcome::Resolved(v) => {
                                let v = v.clone();
                                match storage::with_snapshot(&snap, || catch_rejection(|| f(v))) {
                                    Ok(u) => Outcome::Resolved(u),
                                    Err(e) => Outcome::Rejected(e),
                                }
                            }
                            Outcome::Rejected(e) => Outcome::Rejected(e.clone()),
                        };
                        complete(&out_for_waiter, outcome, Wakeup::Now);
                    })),
                );
                Promise { inner: out }
            }
        }
    }
}

/// Runs `f()`; on rejection, forwards to `g(error)`. Resolved values pass
/// through untouched.
pub fn catch<T, F, G>(f: F, g: G) -> Promise<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Promise<T>,
    G: FnOnce(Error) -> Promise<T> + 'static,
{
    let p = match catch_rejection(f) {
        Ok(p) => p,
        Err(e) => Promise::rejected(e),
    };
    let rep = repr(&p.inner);
    match peek(&rep) {
        Some(Outcome::Resolved(_)) => p,
        Some(Outcome::Rejected(e)) => match catch_rejection(|| g(e)) {
            Ok(q) => q,
            Err(e2) => Promise::rejected(e2),
        },
        None => {
            let snap = storage::snapshot();
            let out = new_pending::<T>(CancelMode::forward_one(Rc::clone(&rep) as Rc<dyn CancelTarget>));
            let out_for_waiter = Rc::clone(&out);
            add_waiter(
                &rep,
                Waiter::Permanent(Box::new(move |o: &Outcome<T>| match o {
                    Outcome::Resolved(v) => {
                        complete(&out_for_waiter, Outcome::Resolved(v.clone()), Wakeup::Now);
                    }
                    Outcome::Rejected(e) => {
                        let e = e.clone();
                        match storage::with_snapshot(&snap, || catch_rejection(|| g(e))) {
                            Ok(q) => connect(&out_for_waiter, &q),
                            Err(e2) => {
                                complete(&out_for_waiter, Outcome::Rejected(e2), Wakeup::Now);
                            }
                        }
                    }
                })),
            );
            Promise { inner: out }
        }
    }
}

/// Runs `f()`; dispatches to `g` on resolution, `h` on rejection.
pub fn try_bind<T, U, F, G, H>(f: F, g: G, h: H) -> Promise<U>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnOnce() -> Promise<T>,
    G: FnOnce(T) -> Promise<U> + 'static,
    H: FnOnce(Error) -> Promise<U> + 'static,
{
    let p = match catch_rejection(f) {
        Ok(p) => p,
        Err(e) => Promise::rejected(e),
    };
    let rep = repr(&p.inner);
    match peek(&rep) {
        Some(Outcome::Resolved(v)) => match catch_rejection(|| g(v)) {
            Ok(q) => q,
            Err(e) => Promise::rejected(e),
        },
        Some(Outcome::Rejected(e)) => match catch_rejection(|| h(e)) {
            Ok(q) => q,
            Err(e2) => Promise::rejected(e2),
        },
        None => {
            let snap = storage::snapshot();
            let out = new_pending::<U>(CancelMode::forward_one(Rc::clone(&rep) as Rc<dyn CancelTarget>));
            let out_for_waiter = Rc::clone(&out);
            add_waiter(
                &rep,
                Waiter::Permanent(Box::new(move |o: &Outcome<T>| {
                    let produced = match o {
                        Outcome::Resolved(v) => {
                            let v = v.clone();
                            storage::with_snapshot(&snap, || catch_rejection(|| g(v)))
                        }
                        Outcome::Rejected(e) => {
                            let e = e.clone();
                            storage::with_snapshot(&snap, || catch_rejection(|| h(e)))
                        }
                    };
                    match produced {
                        Ok(q) => connect(&out_for_waiter, &q),
                        Err(e) => complete(&out_for_waiter, Outcome::Rejected(e), Wakeup::Now),
                    }
                })),
            );
            Promise { inner: out }
        }
    }
}

/// Forwards `outcome` once the cleanup promise produced by `g` resolves; a
/// failing cleanup replaces the outcome.
fn finalize_after<T, G>(outcome: Outcome<T>, g: G) -> Promise<T>
where
    T: Clone + 'static,
    G: FnOnce() -> Promise<()> + 'static,
{
    let q = match catch_rejection(g) {
        Ok(q) => q,
        Err(e) => Promise::rejected(e),
    };
    let qrep = repr(&q.inner);
    match peek(&qrep) {
        Some(Outcome::Resolved(())) => promise_of_outcome(outcome),
        Some(Outcome::Rejected(e)) => Promise::rejected(e),
        None => {
            let out = new_pending::<T>(CancelMode::forward_one(Rc::clone(&qrep) as Rc<dyn CancelTarget>));
            let out_for_waiter = Rc::clone(&out);
            add_waiter(
                &qrep,
                Waiter::Permanent(Box::new(move |qo: &Outcome<()>| {
                    let result = match qo {
                        Outcome::Resolved(()) => outcome,
                        Outcome::Rejected(e) => Outcome::Rejected(e.clone()),
                    };
                    complete(&out_for_waiter, result, Wakeup::Now);
                })),
            );
            Promise { inner: out }
        }
    }
}

/// Runs `f()`, then always runs `g()` before forwarding `f`'s outcome.
///
/// `g` runs exactly once, after `f`'s outcome is known. If `g` fails, its
/// failure replaces the outcome.
pub fn finalize<T, F, G>(f: F, g: G) -> Promise<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Promise<T>,
    G: FnOnce() -> Promise<()> + 'static,
{
    let p = match catch_rejection(f) {
        Ok(p) => p,
        Err(e) => Promise::rejected(e),
    };
    let rep = repr(&p.inner);
    match peek(&rep) {
        Some(outcome) => finalize_after(outcome, g),
        None => {
            let snap = storage::snapshot();
            let out = new_pending::<T>(CancelMode::forward_one(Rc::clone(&rep) as Rc<dyn CancelTarget>));
            let out_for_waiter = Rc::clone(&out);
            add_waiter(
                &rep,
                Waiter::Permanent(Box::new(move |o: &Outcome<T>| {
                    let o = o.clone();
                    let q = storage::with_snapshot(&snap, || finalize_after(o, g));
                    connect(&out_for_waiter, &q);
                })),
            );
            Promise { inner: out }
        }
    }
}
