//! The promise graph: deferred values, forwarding, and cancellation.
//!
//! A [`Promise`] is a shared handle to a computation whose result will
//! eventually be resolved with a value or rejected with an [`Error`]; a
//! [`Resolver`] is the write capability for the same underlying cell. The
//! graph has multiple owners by construction — a promise is shared between
//! its producer, its resolver, and every waiter — so handles are `Rc`s over
//! interior-mutable state and the whole scheduler is single-threaded.
//!
//! # Forwarding
//!
//! When a combinator learns that its output should mirror another pending
//! promise, the *child* promise is forwarded onto the *parent* (the handle
//! users already hold), and lookups compress forwarding chains onto the
//! representative exactly like union-find. Forwarding child-onto-parent is
//! what keeps tail-recursive `bind` loops at constant depth.
//!
//! # Cancellation
//!
//! Cancellation is a protocol, not a silent drop. Each pending promise
//! carries a cancel handle: inert (wait pairs), the task default (reject
//! self with `Cancelled`), or a forward list pointing at the antecedents a
//! combinator chain was built from. The handle is replaced with an inert one
//! before it runs, so delivery is at-most-once, and cancelling an
//! already-terminal promise is a silent no-op — an owner may cancel a task
//! after another party has already scheduled its resolution, and both paths
//! must converge without raising.
//!
//! # Wakeup flavours
//!
//! Resolving immediately runs waiters inline. `resolve_later` enqueues the
//! wakeup on a thread-local queue that drains at the top of the triggering
//! call stack, which bounds stack depth when a waiter resolves many other
//! promises synchronously.

pub(crate) mod waiters;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::sequence::Sequence;
use crate::storage;
use waiters::{RemovableCell, Waiter, WaiterSet, CLEANUP_THROTTLE};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// A terminal outcome: the value or the rejection.
pub(crate) enum Outcome<T> {
    Resolved(T),
    Rejected(Error),
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Resolved(v) => Self::Resolved(v.clone()),
            Self::Rejected(e) => Self::Rejected(e.clone()),
        }
    }
}

impl<T> Outcome<T> {
    pub(crate) fn into_result(self) -> Result<T> {
        match self {
            Self::Resolved(v) => Ok(v),
            Self::Rejected(e) => Err(e),
        }
    }
}

/// Observer view of a promise's state. Does not force anything.
#[derive(Debug, Clone)]
pub enum PromiseState<T> {
    /// The promise resolved with a value.
    Resolved(T),
    /// The promise was rejected.
    Rejected(Error),
    /// The promise has not reached a terminal state yet.
    Pending,
}

/// Something a cancellation request can be forwarded to.
///
/// Object-safe so that a cancel handle can point at promises of a different
/// value type than its owner's.
pub(crate) trait CancelTarget {
    fn request_cancel(&self);
}

/// How a pending promise reacts to a cancellation request.
pub(crate) enum CancelMode {
    /// Nothing to do (wait pairs, spent handles).
    Inert,
    /// Reject self with `Cancelled` (task pairs).
    Task,
    /// Forward the request to one or more antecedents.
    Forward(SmallVec<[Rc<dyn CancelTarget>; 2]>),
}

impl CancelMode {
    pub(crate) fn forward_one(target: Rc<dyn CancelTarget>) -> Self {
        let mut targets: SmallVec<[Rc<dyn CancelTarget>; 2]> = SmallVec::new();
        targets.push(target);
        Self::Forward(targets)
    }

    pub(crate) fn forward_many(targets: impl IntoIterator<Item = Rc<dyn CancelTarget>>) -> Self {
        Self::Forward(targets.into_iter().collect())
    }
}

pub(crate) struct PendingState<T> {
    waiters: WaiterSet<T>,
    cancel: CancelMode,
    /// Removable waiters cleared since the last compaction.
    cleared: u32,
}

enum Slot<T: 'static> {
    Pending(PendingState<T>),
    Terminal(Outcome<T>),
    /// Transparently forwarded; compressed on every representative lookup.
    Forward(Rc<Inner<T>>),
}

pub(crate) struct Inner<T: 'static> {
    slot: RefCell<Slot<T>>,
}

impl<T: 'static> CancelTarget for Inner<T> {
    fn request_cancel(&self) {
        let next = match &*self.slot.borrow() {
            Slot::Forward(n) => Some(Rc::clone(n)),
            _ => None,
        };
        match next {
            Some(next) => {
                let rep = repr(&next);
                *self.slot.borrow_mut() = Slot::Forward(Rc::clone(&rep));
                do_cancel(&rep);
            }
            None => do_cancel(self),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph operations
// ---------------------------------------------------------------------------

pub(crate) fn new_pending<T: 'static>(cancel: CancelMode) -> Rc<Inner<T>> {
    Rc::new(Inner {
        slot: RefCell::new(Slot::Pending(PendingState {
            waiters: WaiterSet::Empty,
            cancel,
            cleared: 0,
        })),
    })
}

fn new_terminal<T: 'static>(outcome: Outcome<T>) -> Rc<Inner<T>> {
    Rc::new(Inner {
        slot: RefCell::new(Slot::Terminal(outcome)),
    })
}

/// Walks forwarding edges to the representative, compressing the path.
pub(crate) fn repr<T: 'static>(p: &Rc<Inner<T>>) -> Rc<Inner<T>> {
    let mut cur = Rc::clone(p);
    let next = {
        let slot = cur.slot.borrow();
        match &*slot {
            Slot::Forward(n) => Some(Rc::clone(n)),
            _ => None,
        }
    };
    let next = match next {
        Some(n) => n,
        None => return cur,
    };
    let mut chain = vec![cur];
    cur = next;
    loop {
        let next = match &*cur.slot.borrow() {
            Slot::Forward(n) => Rc::clone(n),
            _ => break,
        };
        chain.push(cur);
        cur = next;
    }
    for link in chain {
        *link.slot.borrow_mut() = Slot::Forward(Rc::clone(&cur));
    }
    cur
}

/// The terminal outcome, if the promise has one.
pub(crate) fn peek<T: Clone + 'static>(p: &Rc<Inner<T>>) -> Option<Outcome<T>> {
    let rep = repr(p);
    let x = match &*rep.slot.borrow() {
        Slot::Terminal(o) => Some(o.clone()),
        _ => None,
    };
    x
}

/// Registers a waiter; fires it immediately if the promise is terminal.
pub(crate) fn add_waiter<T: 'static>(p: &Rc<Inner<T>>, waiter: Waiter<T>) {
    let rep = repr(p);
    let pending = matches!(&*rep.slot.borrow(), Slot::Pending(_));
    if pending {
        if let Slot::Pending(state) = &mut *rep.slot.borrow_mut() {
            state.waiters.append(waiter);
        }
    } else {
        let slot = rep.slot.borrow();
        if let Slot::Terminal(outcome) = &*slot {
            waiter.invoke(outcome);
        }
    }
}

/// Which wakeup flavour a resolution uses.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wakeup {
    /// Run waiters inline.
    Now,
    /// Enqueue; drained at the top of the triggering call stack.
    Later,
}

/// Moves a promise to a terminal state and fires its waiters.
///
/// Completing a promise that is already `rejected(Cancelled)` is a silent
/// no-op. Completing any other terminal promise panics.
pub(crate) fn complete<T: 'static>(p: &Rc<Inner<T>>, outcome: Outcome<T>, how: Wakeup) {
    let rep = repr(p);
    match &*rep.slot.borrow() {
        Slot::Terminal(Outcome::Rejected(e)) if e.is_cancelled() => return,
        Slot::Terminal(_) => panic!("attempt to resolve an already-resolved promise"),
        Slot::Pending(_) => {}
        Slot::Forward(_) => unreachable!("representative is forwarded"),
    }
    match how {
        Wakeup::Later if in_resolution_loop() => {
            let rep = Rc::clone(&rep);
            defer_wakeup(Box::new(move || complete(&rep, outcome, Wakeup::Now)));
        }
        _ => settle(&rep, outcome),
    }
}

/// Swaps a pending representative to terminal and fires its waiters.
fn settle<T: 'static>(inner: &Inner<T>, outcome: Outcome<T>) {
    let waiters = match std::mem::replace(&mut *inner.slot.borrow_mut(), Slot::Terminal(outcome)) {
        Slot::Pending(state) => state.waiters,
        _ => unreachable!("settle requires a pending promise"),
    };
    enter_resolution_loop(|| {
        // Shared borrow held while waiters run: observers may re-borrow, and
        // every mutating path checks for the terminal state first.
        let slot = inner.slot.borrow();
        match &*slot {
            Slot::Terminal(outcome) => waiters.fire(outcome),
            _ => unreachable!(),
        }
    });
}

fn do_cancel<T: 'static>(inner: &Inner<T>) {
    match &*inner.slot.borrow() {
        Slot::Pending(_) => {}
        _ => return, // terminal: cancellation converges silently
    }
    let action = match &mut *inner.slot.borrow_mut() {
        Slot::Pending(state) => std::mem::replace(&mut state.cancel, CancelMode::Inert),
        _ => return,
    };
    match action {
        CancelMode::Inert => {}
        CancelMode::Task => {
            tracing::debug!("cancelling task promise");
            settle(inner, Outcome::Rejected(Error::cancelled()));
        }
        CancelMode::Forward(targets) => {
            for target in targets {
                target.request_cancel();
            }
        }
    }
}

/// Makes `parent` mirror `child`.
///
/// If `child` is terminal its outcome is copied over. Otherwise `child` is
/// forwarded onto `parent` — the direction that keeps user-visible handles
/// working and tail-recursive chains flat — the cancel handle is retargeted
/// to `child`'s, and the waiter sets are merged.
///
/// # Panics
///
/// Panics if `parent` is not pending while `child` still is.
pub(crate) fn connect<T: Clone + 'static>(parent: &Rc<Inner<T>>, child: &Promise<T>) {
    let parent = repr(parent);
    let child = repr(&child.inner);
    if Rc::ptr_eq(&parent, &child) {
        return;
    }
    let terminal = match &*child.slot.borrow() {
        Slot::Terminal(o) => Some(o.clone()),
        Slot::Pending(_) => None,
        Slot::Forward(_) => unreachable!("representative is forwarded"),
    };
    match terminal {
        Some(outcome) => complete(&parent, outcome, Wakeup::Now),
        None => {
            match &*parent.slot.borrow() {
                Slot::Pending(_) => {}
                _ => panic!("attempt to connect onto a non-pending promise"),
            }
            let moved = {
                let mut slot = child.slot.borrow_mut();
                match std::mem::replace(&mut *slot, Slot::Forward(Rc::clone(&parent))) {
                    Slot::Pending(state) => state,
                    _ => unreachable!(),
                }
            };
            if let Slot::Pending(state) = &mut *parent.slot.borrow_mut() {
                state.cancel = moved.cancel;
                state.waiters.merge(moved.waiters);
                state.cleared += moved.cleared;
                if state.cleared > CLEANUP_THROTTLE {
                    state.waiters.compact();
                    state.cleared = 0;
                }
            }
        }
    }
}

/// Records that a shared removable cell registered on `ps` has been cleared,
/// compacting any waiter set that has accumulated too many dead cells.
pub(crate) fn cleanup_removed<T: 'static>(ps: &[Promise<T>]) {
    for p in ps {
        let rep = repr(&p.inner);
        let pending = matches!(&*rep.slot.borrow(), Slot::Pending(_));
        if !pending {
            continue;
        }
        if let Slot::Pending(state) = &mut *rep.slot.borrow_mut() {
            state.cleared += 1;
            if state.cleared > CLEANUP_THROTTLE {
                state.waiters.compact();
                state.cleared = 0;
            }
        };
    }
}

pub(crate) fn promise_of_outcome<T: 'static>(outcome: Outcome<T>) -> Promise<T> {
    Promise {
        inner: new_terminal(outcome),
    }
}

// ---------------------------------------------------------------------------
// Resolution loop: immediate vs deferred wakeups
// ---------------------------------------------------------------------------

struct ResolutionState {
    in_loop: bool,
    queue: VecDeque<Box<dyn FnOnce()>>,
}

thread_local! {
    static RESOLUTION: RefCell<ResolutionState> = RefCell::new(ResolutionState {
        in_loop: false,
        queue: VecDeque::new(),
    });
}

fn in_resolution_loop() -> bool {
    RESOLUTION.with(|r| r.borrow().in_loop)
}

fn defer_wakeup(job: Box<dyn FnOnce()>) {
    RESOLUTION.with(|r| r.borrow_mut().queue.push_back(job));
}

/// Runs `f`; if this is the outermost resolution, drains the deferred-wakeup
/// queue afterwards so nested resolutions unwind before their waiters run.
fn enter_resolution_loop(f: impl FnOnce()) {
    let entered = RESOLUTION.with(|r| {
        let mut r = r.borrow_mut();
        if r.in_loop {
            false
        } else {
            r.in_loop = true;
            true
        }
    });
    if !entered {
        f();
        return;
    }
    struct LoopGuard;
    impl Drop for LoopGuard {
        fn drop(&mut self) {
            RESOLUTION.with(|r| r.borrow_mut().in_loop = false);
        }
    }
    let _guard = LoopGuard;
    f();
    loop {
        let job = RESOLUTION.with(|r| r.borrow_mut().queue.pop_front());
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

/// True if deferred wakeups are waiting to be drained.
pub(crate) fn has_deferred_wakeups() -> bool {
    RESOLUTION.with(|r| !r.borrow().queue.is_empty())
}

/// Drains the deferred-wakeup queue if no resolution is in progress.
pub(crate) fn drain_deferred() {
    if !in_resolution_loop() {
        enter_resolution_loop(|| {});
    }
}

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// A handle to a value that may not be known yet.
///
/// Handles are cheap to clone and share one underlying cell. The scheduler is
/// single-threaded: promises are `!Send` and all global state is
/// thread-local.
pub struct Promise<T: 'static> {
    pub(crate) inner: Rc<Inner<T>>,
}

impl<T: 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rep = repr(&self.inner);
        let tag = match &*rep.slot.borrow() {
            Slot::Pending(_) => "pending",
            Slot::Terminal(Outcome::Resolved(_)) => "resolved",
            Slot::Terminal(Outcome::Rejected(_)) => "rejected",
            Slot::Forward(_) => "forwarded",
        };
        f.debug_struct("Promise").field("state", &tag).finish()
    }
}

/// The write capability of a promise created with [`Promise::wait`] or
/// [`Promise::task`]. Consumed on use, so a promise is resolved at most once
/// per resolver.
pub struct Resolver<T: 'static> {
    inner: Rc<Inner<T>>,
}

impl<T: 'static> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl<T: 'static> Promise<T> {
    /// A promise already resolved with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        promise_of_outcome(Outcome::Resolved(value))
    }

    /// A promise already rejected with `error`.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        promise_of_outcome(Outcome::Rejected(error))
    }

    /// A pending promise with an inert cancel handle.
    ///
    /// Cancellation does not propagate through the resolver of a wait pair.
    #[must_use]
    pub fn wait() -> (Self, Resolver<T>) {
        let inner = new_pending(CancelMode::Inert);
        (
            Self {
                inner: Rc::clone(&inner),
            },
            Resolver { inner },
        )
    }

    /// A pending promise whose default cancel handle rejects it with
    /// `Cancelled`.
    #[must_use]
    pub fn task() -> (Self, Resolver<T>) {
        let inner = new_pending(CancelMode::Task);
        (
            Self {
                inner: Rc::clone(&inner),
            },
            Resolver { inner },
        )
    }

    /// True while the promise has not reached a terminal state.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(&*repr(&self.inner).slot.borrow(), Slot::Pending(_))
    }

    /// True if the promise resolved with a value.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(
            &*repr(&self.inner).slot.borrow(),
            Slot::Terminal(Outcome::Resolved(_))
        )
    }

    /// True if the promise was rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(
            &*repr(&self.inner).slot.borrow(),
            Slot::Terminal(Outcome::Rejected(_))
        )
    }

    /// Requests cancellation.
    ///
    /// Synchronous: by the time this returns, either the promise has
    /// transitioned to `rejected(Cancelled)` (and its waiters have fired) or
    /// its registered cancel handle has run. Cancelling a terminal promise
    /// is a silent no-op, and delivery is at-most-once.
    pub fn cancel(&self) {
        let rep = repr(&self.inner);
        do_cancel(&rep);
    }

    /// Runs `f` with the value when the promise resolves.
    pub fn on_success(&self, f: impl FnOnce(&T) + 'static) {
        let snap = storage::snapshot();
        add_waiter(
            &self.inner,
            Waiter::Permanent(Box::new(move |o| {
                if let Outcome::Resolved(v) = o {
                    storage::with_snapshot(&snap, || f(v));
                }
            })),
        );
    }

    /// Runs `f` with the error when the promise is rejected.
    pub fn on_failure(&self, f: impl FnOnce(&Error) + 'static) {
        let snap = storage::snapshot();
        add_waiter(
            &self.inner,
            Waiter::Permanent(Box::new(move |o| {
                if let Outcome::Rejected(e) = o {
                    storage::with_snapshot(&snap, || f(e));
                }
            })),
        );
    }

    /// Runs `f` when the promise reaches either terminal state.
    pub fn on_termination(&self, f: impl FnOnce() + 'static) {
        let snap = storage::snapshot();
        add_waiter(
            &self.inner,
            Waiter::Permanent(Box::new(move |_| storage::with_snapshot(&snap, f))),
        );
    }

    /// Runs `f` on resolution or `g` on rejection.
    pub fn on_any(&self, f: impl FnOnce(&T) + 'static, g: impl FnOnce(&Error) + 'static) {
        let snap = storage::snapshot();
        add_waiter(
            &self.inner,
            Waiter::Permanent(Box::new(move |o| {
                storage::with_snapshot(&snap, || match o {
                    Outcome::Resolved(v) => f(v),
                    Outcome::Rejected(e) => g(e),
                });
            })),
        );
    }

    /// Runs `f` if the promise is rejected by cancellation.
    pub fn on_cancel(&self, f: impl FnOnce() + 'static) {
        let snap = storage::snapshot();
        add_waiter(
            &self.inner,
            Waiter::Permanent(Box::new(move |o| {
                if let Outcome::Rejected(e) = o {
                    if e.is_cancelled() {
                        storage::with_snapshot(&snap, f);
                    }
                }
            })),
        );
    }

    /// Declares the result unwanted. Rejections are logged rather than lost.
    pub fn ignore_result(self) {
        add_waiter(
            &self.inner,
            Waiter::Permanent(Box::new(|o| {
                if let Outcome::Rejected(e) = o {
                    if e.is_cancelled() {
                        tracing::debug!(error = %e, "ignored promise was cancelled");
                    } else {
                        tracing::error!(error = %e, "ignored promise was rejected");
                    }
                }
            })),
        );
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// The promise's current state. Does not force anything.
    #[must_use]
    pub fn state(&self) -> PromiseState<T> {
        match peek(&self.inner) {
            Some(Outcome::Resolved(v)) => PromiseState::Resolved(v),
            Some(Outcome::Rejected(e)) => PromiseState::Rejected(e),
            None => PromiseState::Pending,
        }
    }

    /// Non-blocking snapshot: `Ok(Some(v))` if resolved, `Ok(None)` if
    /// pending, the rejection as `Err` otherwise.
    pub fn poll(&self) -> Result<Option<T>> {
        match peek(&self.inner) {
            Some(Outcome::Resolved(v)) => Ok(Some(v)),
            Some(Outcome::Rejected(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl<T: 'static> Resolver<T> {
    /// Resolves the promise, firing waiters inline.
    ///
    /// # Panics
    ///
    /// Panics if the promise is already terminal, unless it is
    /// `rejected(Cancelled)` — then the call is a silent no-op.
    pub fn resolve(self, value: T) {
        complete(&self.inner, Outcome::Resolved(value), Wakeup::Now);
    }

    /// Rejects the promise, firing waiters inline.
    ///
    /// # Panics
    ///
    /// Same contract as [`Resolver::resolve`].
    pub fn reject(self, error: Error) {
        complete(&self.inner, Outcome::Rejected(error), Wakeup::Now);
    }

    /// Resolves via the deferred-wakeup queue.
    pub fn resolve_later(self, value: T) {
        complete(&self.inner, Outcome::Resolved(value), Wakeup::Later);
    }

    /// Rejects via the deferred-wakeup queue.
    pub fn reject_later(self, error: Error) {
        complete(&self.inner, Outcome::Rejected(error), Wakeup::Later);
    }
}

/// A promise mirroring `d` whose cancellation does not touch `d`.
///
/// Cancelling the copy rejects it with `Cancelled` and detaches its waiter
/// from `d`, so the original keeps running undisturbed.
#[must_use]
pub fn protected<T: Clone + 'static>(d: &Promise<T>) -> Promise<T> {
    let rep = repr(&d.inner);
    if !matches!(&*rep.slot.borrow(), Slot::Pending(_)) {
        return Promise { inner: rep };
    }
    let out = new_pending::<T>(CancelMode::Task);
    let out_for_waiter = Rc::clone(&out);
    let (waiter, cell): (Waiter<T>, RemovableCell<T>) = Waiter::removable(Box::new(move |o| {
        complete(&out_for_waiter, o.clone(), Wakeup::Now);
    }));
    add_waiter(&rep, waiter);

    let result = Promise { inner: out };
    let original = d.clone();
    result.on_cancel(move || {
        cell.borrow_mut().take();
        cleanup_removed(&[original]);
    });
    result
}

// ---------------------------------------------------------------------------
// Paused promises
// ---------------------------------------------------------------------------

thread_local! {
    static PAUSED: Sequence<Resolver<()>> = Sequence::new();
    static PAUSE_NOTIFIER: RefCell<Option<Box<dyn FnMut(usize)>>> = RefCell::new(None);
}

/// A promise that resolves with `()` on the next drain of the paused queue.
///
/// Paused promises are task pairs: cancelling one rejects it with
/// `Cancelled`, and the eventual drain skips it silently.
pub fn pause() -> Promise<()> {
    let (p, r) = Promise::task();
    PAUSED.with(|seq| {
        seq.push_back(r);
    });
    let count = paused_count();
    let notifier = PAUSE_NOTIFIER.with(|n| n.borrow_mut().take());
    if let Some(mut notifier) = notifier {
        notifier(count);
        PAUSE_NOTIFIER.with(|n| {
            let mut slot = n.borrow_mut();
            if slot.is_none() {
                *slot = Some(notifier);
            }
        });
    }
    p
}

/// Resolves every currently paused promise, in pause order.
///
/// Promises paused while the drain runs belong to the next batch.
pub fn wakeup_paused() {
    let batch = PAUSED.with(Sequence::take_all);
    for resolver in batch {
        resolver.resolve(());
    }
}

/// The number of promises currently paused.
#[must_use]
pub fn paused_count() -> usize {
    PAUSED.with(Sequence::len)
}

/// Registers a callback invoked with the new paused count on every
/// [`pause`]. Lets an external scheduler know there is something to drain.
pub fn register_pause_notifier(f: impl FnMut(usize) + 'static) {
    PAUSE_NOTIFIER.with(|n| *n.borrow_mut() = Some(Box::new(f)));
}
