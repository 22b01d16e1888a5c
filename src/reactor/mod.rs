//! Reactor abstraction: file-descriptor readiness and timer callbacks.
//!
//! A reactor is the external event source the scheduler blocks on. The
//! [`Reactor`] trait is the only thing the driver depends on; two
//! interchangeable implementations are provided:
//!
//! | Implementation | Mechanism | Module |
//! |----------------|-----------|--------|
//! | [`PollerReactor`] | wraps the `polling` event library (epoll/kqueue) | `poller.rs` |
//! | [`PollReactor`] | `poll(2)` plus its own fd maps and timer heap | `poll.rs` |
//!
//! # Registrations
//!
//! `on_readable`/`on_writable` register a callback invoked every time the
//! descriptor becomes ready; `on_timer` fires once after the delay or on
//! every period. Each registration returns an [`EventHandle`] stop-token:
//! stopping is idempotent and O(1) (fd watchers unlink their list node,
//! timers flip a flag the heap skips lazily).
//!
//! # Ordering
//!
//! Within one iteration: due timers fire first (deadline order), then all
//! readable callbacks, then all writable callbacks; callbacks on the same
//! event fire in insertion order.
//!
//! # Fault isolation
//!
//! A panicking callback is caught and logged; it never stops the iteration.

pub mod poller;
pub(crate) mod timer;

#[allow(unsafe_code)] // poll(2) via libc
pub mod poll;

pub use poll::PollReactor;
pub use poller::PollerReactor;

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::error::catch_rejection;
use crate::sequence::Sequence;

/// Stop-token for an active registration.
///
/// Cloneable; all clones refer to the same registration. [`stop`] is
/// idempotent and O(1).
///
/// [`stop`]: EventHandle::stop
#[derive(Clone)]
pub struct EventHandle {
    state: Rc<HandleState>,
}

struct HandleState {
    stopped: Cell<bool>,
    unlink: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl EventHandle {
    /// A handle with no unlink action yet (timers, or pre-linked watchers).
    pub(crate) fn bare() -> Self {
        Self {
            state: Rc::new(HandleState {
                stopped: Cell::new(false),
                unlink: RefCell::new(None),
            }),
        }
    }

    /// Installs or replaces the unlink action run on [`stop`].
    ///
    /// Used after the registration is linked, and by [`Reactor::transfer`]
    /// to point an existing handle at its new home.
    ///
    /// [`stop`]: EventHandle::stop
    pub(crate) fn retarget(&self, unlink: Box<dyn FnOnce()>) {
        *self.state.unlink.borrow_mut() = Some(unlink);
    }

    /// Stops the registration. Idempotent.
    pub fn stop(&self) {
        if self.state.stopped.replace(true) {
            return;
        }
        let unlink = self.state.unlink.borrow_mut().take();
        if let Some(unlink) = unlink {
            unlink();
        }
    }

    /// True until [`stop`](EventHandle::stop) is called.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.stopped.get()
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Shared, re-entrant callback storage for a registration.
pub(crate) type Callback = Rc<RefCell<Box<dyn FnMut(&EventHandle)>>>;

/// One fd watcher: the callback plus the handle passed back into it.
#[derive(Clone)]
pub(crate) struct FdWatcher {
    pub(crate) callback: Callback,
    pub(crate) handle: EventHandle,
}

/// Invokes every active watcher of a list, isolating panics per callback.
pub(crate) fn dispatch_watchers(seq: &Sequence<FdWatcher>) {
    for watcher in seq.snapshot() {
        if !watcher.handle.is_active() {
            continue;
        }
        let callback = Rc::clone(&watcher.callback);
        let handle = watcher.handle.clone();
        if let Err(e) = catch_rejection(|| (callback.borrow_mut())(&handle)) {
            tracing::error!(error = %e, "reactor callback panicked; continuing iteration");
        }
    }
}

/// Which direction a transferred fd watcher listens on.
#[derive(Clone, Copy)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Re-registers a watcher on `other` and points the existing handle at the
/// new registration, so stopping it keeps working after a transfer.
pub(crate) fn move_fd_watcher(
    other: &dyn Reactor,
    fd: RawFd,
    watcher: &FdWatcher,
    direction: Direction,
) {
    let callback = Rc::clone(&watcher.callback);
    let delegate = Box::new(move |handle: &EventHandle| (callback.borrow_mut())(handle));
    let registered = match direction {
        Direction::Read => other.on_readable(fd, delegate),
        Direction::Write => other.on_writable(fd, delegate),
    };
    match registered {
        Ok(new_handle) => watcher
            .handle
            .retarget(Box::new(move || new_handle.stop())),
        Err(e) => tracing::error!(error = %e, fd, "failed to transfer fd watcher"),
    }
}

/// Re-registers a timer on `other` with its full delay, retargeting the
/// existing handle.
pub(crate) fn move_timer(
    other: &dyn Reactor,
    period: Duration,
    repeat: bool,
    callback: &Callback,
    handle: &EventHandle,
) {
    let callback = Rc::clone(callback);
    let delegate = Box::new(move |h: &EventHandle| (callback.borrow_mut())(h));
    match other.on_timer(period, repeat, delegate) {
        Ok(new_handle) => handle.retarget(Box::new(move || new_handle.stop())),
        Err(e) => tracing::error!(error = %e, "failed to transfer timer"),
    }
}

/// An external source of I/O readiness and timer events.
///
/// Single-threaded, like the rest of the scheduler: implementations use
/// interior mutability and are driven from the owning thread only.
pub trait Reactor {
    /// Performs one reactor pass.
    ///
    /// With `block`, suspends until a descriptor becomes ready, a timer
    /// expires, or a signal wakes the process; otherwise polls and returns
    /// immediately.
    fn iter(&self, block: bool);

    /// Invokes `callback` every time `fd` becomes readable.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel registration fails.
    fn on_readable(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle>;

    /// Invokes `callback` every time `fd` becomes writable.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel registration fails.
    fn on_writable(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle>;

    /// Invokes `callback` once after `delay`, or every `delay` if `repeat`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registration fails.
    fn on_timer(
        &self,
        delay: Duration,
        repeat: bool,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle>;

    /// Invokes all readable and writable callbacks registered for `fd`
    /// without consulting the kernel. Used by tests and by buffered channel
    /// layers to flush state they already know is ready.
    fn fake_io(&self, fd: RawFd);

    /// Number of active readable watchers.
    fn readable_count(&self) -> usize;

    /// Number of active writable watchers.
    fn writable_count(&self) -> usize;

    /// Number of active timers.
    fn timer_count(&self) -> usize;

    /// Moves every live registration onto `other`.
    ///
    /// Existing [`EventHandle`]s keep working: stopping one stops the moved
    /// registration in its new reactor. Timers restart with their full
    /// delay.
    fn transfer(&self, other: &dyn Reactor);

    /// Stops every registration and releases the reactor's resources.
    fn destroy(&self);
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<dyn Reactor>>> = RefCell::new(None);
}

/// The thread's current reactor, creating the default [`PollerReactor`] on
/// first use.
///
/// # Panics
///
/// Panics if the default reactor cannot be initialized (out of file
/// descriptors).
#[must_use]
pub fn current() -> Rc<dyn Reactor> {
    CURRENT.with(|cell| {
        let mut cell = cell.borrow_mut();
        if cell.is_none() {
            let reactor = PollerReactor::new().expect("failed to initialize default reactor");
            *cell = Some(Rc::new(reactor));
        }
        Rc::clone(cell.as_ref().expect("reactor just installed"))
    })
}

/// Replaces the thread's current reactor, transferring live registrations
/// from the old one and destroying it.
pub fn set_current(reactor: Rc<dyn Reactor>) {
    let old = CURRENT.with(|cell| cell.borrow_mut().replace(Rc::clone(&reactor)));
    if let Some(old) = old {
        tracing::debug!("swapping reactor implementation");
        old.transfer(&*reactor);
        old.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_idempotent_and_runs_unlink_once() {
        let count = Rc::new(Cell::new(0));
        let handle = EventHandle::bare();
        let c = Rc::clone(&count);
        handle.retarget(Box::new(move || c.set(c.get() + 1)));

        assert!(handle.is_active());
        handle.stop();
        handle.stop();
        assert!(!handle.is_active());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn clones_share_the_stop_state() {
        let handle = EventHandle::bare();
        let other = handle.clone();
        other.stop();
        assert!(!handle.is_active());
    }
}
