//! Default reactor: a thin wrapper over the `polling` event library.
//!
//! The library keeps persistent kernel registrations (epoll on Linux,
//! kqueue on the BSDs), so unlike [`PollReactor`](super::PollReactor) this
//! reactor does not rebuild its descriptor set every pass — it only tells
//! the poller about changes. Registrations delivered by the library are
//! oneshot and are re-armed after each dispatch.
//!
//! Timers are not a `polling` concept; they live in the same min-heap the
//! fallback uses, and the heap's earliest deadline bounds the wait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use polling::{Event as PollEvent, Poller};

use super::timer::{self, StagedTimer, TimerHeap};
use super::{
    dispatch_watchers, move_fd_watcher, move_timer, Direction, EventHandle, FdWatcher, Reactor,
};
use crate::sequence::Sequence;

#[derive(Default)]
struct FdSlot {
    read: Sequence<FdWatcher>,
    write: Sequence<FdWatcher>,
}

/// Converts a slot's live interest into the library's event type.
fn event_for(fd: RawFd, slot: &FdSlot) -> PollEvent {
    let key = fd as usize;
    match (!slot.read.is_empty(), !slot.write.is_empty()) {
        (true, true) => PollEvent::all(key),
        (true, false) => PollEvent::readable(key),
        (false, true) => PollEvent::writable(key),
        (false, false) => PollEvent::none(key),
    }
}

struct PollerInner {
    poller: Poller,
    slots: RefCell<HashMap<RawFd, FdSlot>>,
    timers: RefCell<TimerHeap>,
    staged: RefCell<Vec<StagedTimer>>,
}

impl PollerInner {
    /// Brings the kernel registration for `fd` in line with the live
    /// watcher lists: re-arms the oneshot interest, or deletes the
    /// registration once both lists are empty.
    fn sync_interest(&self, fd: RawFd) {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get(&fd) else { return };
        if slot.read.is_empty() && slot.write.is_empty() {
            slots.remove(&fd);
            drop(slots);
            if let Err(e) = self.poller.delete(fd) {
                tracing::trace!(error = %e, fd, "deregistration failed");
            }
        } else {
            let event = event_for(fd, slot);
            drop(slots);
            if let Err(e) = self.poller.modify(fd, event) {
                tracing::trace!(error = %e, fd, "re-arm failed");
            }
        }
    }

    fn dispatch(&self, fd: RawFd, direction: Direction) {
        let seq = {
            let slots = self.slots.borrow();
            slots.get(&fd).map(|slot| match direction {
                Direction::Read => slot.read.clone(),
                Direction::Write => slot.write.clone(),
            })
        };
        if let Some(seq) = seq {
            dispatch_watchers(&seq);
        }
    }
}

/// Default reactor wrapping the platform event library.
pub struct PollerReactor {
    inner: Rc<PollerInner>,
}

impl PollerReactor {
    /// Creates a reactor backed by a fresh poller instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel event queue cannot be created (out of
    /// file descriptors).
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(PollerInner {
                poller: Poller::new()?,
                slots: RefCell::new(HashMap::new()),
                timers: RefCell::new(TimerHeap::new()),
                staged: RefCell::new(Vec::new()),
            }),
        })
    }

    fn watch(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
        direction: Direction,
    ) -> io::Result<EventHandle> {
        let handle = EventHandle::bare();
        let (node, event, existed) = {
            let mut slots = self.inner.slots.borrow_mut();
            let existed = slots.contains_key(&fd);
            let slot = slots.entry(fd).or_default();
            let seq = match direction {
                Direction::Read => &slot.read,
                Direction::Write => &slot.write,
            };
            let node = seq.push_back(FdWatcher {
                callback: Rc::new(RefCell::new(callback)),
                handle: handle.clone(),
            });
            (node, event_for(fd, slot), existed)
        };
        let registered = if existed {
            self.inner.poller.modify(fd, event)
        } else {
            self.inner.poller.add(fd, event)
        };
        if let Err(e) = registered {
            node.remove();
            let mut slots = self.inner.slots.borrow_mut();
            if slots
                .get(&fd)
                .is_some_and(|slot| slot.read.is_empty() && slot.write.is_empty())
            {
                slots.remove(&fd);
            }
            return Err(e);
        }
        let weak = Rc::downgrade(&self.inner);
        handle.retarget(Box::new(move || {
            node.remove();
            if let Some(inner) = weak.upgrade() {
                inner.sync_interest(fd);
            }
        }));
        Ok(handle)
    }
}

impl Reactor for PollerReactor {
    fn iter(&self, block: bool) {
        let staged = std::mem::take(&mut *self.inner.staged.borrow_mut());
        self.inner.timers.borrow_mut().absorb(staged);

        let timeout = if block {
            self.inner
                .timers
                .borrow_mut()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };

        let mut events: Vec<PollEvent> = Vec::new();
        let interrupted = match self.inner.poller.wait(&mut events, timeout) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                tracing::error!(error = %e, "poller wait failed");
                return;
            }
        };

        timer::fire_due(&self.inner.timers);
        if interrupted {
            return;
        }

        for event in &events {
            if event.readable {
                self.inner.dispatch(event.key as RawFd, Direction::Read);
            }
        }
        for event in &events {
            if event.writable {
                self.inner.dispatch(event.key as RawFd, Direction::Write);
            }
        }
        // The library's registrations are oneshot: re-arm whatever fired.
        for event in &events {
            self.inner.sync_interest(event.key as RawFd);
        }
    }

    fn on_readable(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle> {
        self.watch(fd, callback, Direction::Read)
    }

    fn on_writable(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle> {
        self.watch(fd, callback, Direction::Write)
    }

    fn on_timer(
        &self,
        delay: Duration,
        repeat: bool,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle> {
        let handle = EventHandle::bare();
        self.inner.staged.borrow_mut().push(StagedTimer {
            created: Instant::now(),
            period: delay,
            repeat,
            callback: Rc::new(RefCell::new(callback)),
            handle: handle.clone(),
        });
        Ok(handle)
    }

    fn fake_io(&self, fd: RawFd) {
        self.inner.dispatch(fd, Direction::Read);
        self.inner.dispatch(fd, Direction::Write);
    }

    fn readable_count(&self) -> usize {
        self.inner
            .slots
            .borrow()
            .values()
            .map(|slot| slot.read.len())
            .sum()
    }

    fn writable_count(&self) -> usize {
        self.inner
            .slots
            .borrow()
            .values()
            .map(|slot| slot.write.len())
            .sum()
    }

    fn timer_count(&self) -> usize {
        self.inner.timers.borrow().active_count()
            + self
                .inner
                .staged
                .borrow()
                .iter()
                .filter(|t| t.handle.is_active())
                .count()
    }

    fn transfer(&self, other: &dyn Reactor) {
        let slots: Vec<_> = self.inner.slots.borrow_mut().drain().collect();
        for (fd, slot) in slots {
            for watcher in slot.read.take_all() {
                if watcher.handle.is_active() {
                    move_fd_watcher(other, fd, &watcher, Direction::Read);
                }
            }
            for watcher in slot.write.take_all() {
                if watcher.handle.is_active() {
                    move_fd_watcher(other, fd, &watcher, Direction::Write);
                }
            }
            if let Err(e) = self.inner.poller.delete(fd) {
                tracing::trace!(error = %e, fd, "deregistration failed during transfer");
            }
        }
        for entry in self.inner.timers.borrow_mut().drain() {
            if entry.handle.is_active() {
                move_timer(other, entry.period, entry.repeat, &entry.callback, &entry.handle);
            }
        }
        let staged = std::mem::take(&mut *self.inner.staged.borrow_mut());
        for staged_timer in staged {
            if staged_timer.handle.is_active() {
                move_timer(
                    other,
                    staged_timer.period,
                    staged_timer.repeat,
                    &staged_timer.callback,
                    &staged_timer.handle,
                );
            }
        }
    }

    fn destroy(&self) {
        let slots: Vec<_> = self.inner.slots.borrow_mut().drain().collect();
        for (fd, slot) in slots {
            for watcher in slot.read.take_all() {
                watcher.handle.stop();
            }
            for watcher in slot.write.take_all() {
                watcher.handle.stop();
            }
            if let Err(e) = self.inner.poller.delete(fd) {
                tracing::trace!(error = %e, fd, "deregistration failed during destroy");
            }
        }
        for entry in self.inner.timers.borrow_mut().drain() {
            entry.handle.stop();
        }
        let staged = std::mem::take(&mut *self.inner.staged.borrow_mut());
        for staged_timer in staged {
            staged_timer.handle.stop();
        }
    }
}

impl std::fmt::Debug for PollerReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerReactor")
            .field("fds", &self.inner.slots.borrow().len())
            .field("timers", &self.timer_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn create_reactor() {
        let reactor = PollerReactor::new().expect("failed to create reactor");
        assert_eq!(reactor.readable_count(), 0);
        assert_eq!(reactor.writable_count(), 0);
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn readable_callback_fires_and_rearms() {
        let reactor = PollerReactor::new().expect("reactor");
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fired = Rc::new(Cell::new(0));

        let count = Rc::clone(&fired);
        reactor
            .on_readable(rx.as_raw_fd(), Box::new(move |_| count.set(count.get() + 1)))
            .expect("register");

        tx.write_all(b"x").expect("write");
        reactor.iter(false);
        assert_eq!(fired.get(), 1);

        // The oneshot registration must have been re-armed.
        tx.write_all(b"y").expect("write");
        reactor.iter(false);
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn stop_deregisters_the_descriptor() {
        let reactor = PollerReactor::new().expect("reactor");
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fired = Rc::new(Cell::new(0));

        let count = Rc::clone(&fired);
        let handle = reactor
            .on_readable(rx.as_raw_fd(), Box::new(move |_| count.set(count.get() + 1)))
            .expect("register");
        handle.stop();

        tx.write_all(b"x").expect("write");
        reactor.iter(false);
        assert_eq!(fired.get(), 0);
        assert_eq!(reactor.readable_count(), 0);
    }

    #[test]
    fn timer_bounds_a_blocking_iteration() {
        let reactor = PollerReactor::new().expect("reactor");
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        reactor
            .on_timer(
                Duration::from_millis(20),
                false,
                Box::new(move |_| flag.set(true)),
            )
            .expect("register");

        let start = Instant::now();
        reactor.iter(true);
        assert!(fired.get());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn fake_io_skips_the_kernel() {
        let reactor = PollerReactor::new().expect("reactor");
        let (_tx, rx) = UnixStream::pair().expect("socket pair");
        let fd = rx.as_raw_fd();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        reactor
            .on_readable(fd, Box::new(move |_| l.borrow_mut().push("read")))
            .expect("register");
        let l = Rc::clone(&log);
        reactor
            .on_writable(fd, Box::new(move |_| l.borrow_mut().push("write")))
            .expect("register");

        reactor.fake_io(fd);
        assert_eq!(*log.borrow(), vec!["read", "write"]);
    }

    #[test]
    fn transfer_moves_registrations_and_keeps_handles_live() {
        let from = PollerReactor::new().expect("reactor");
        let to = super::super::PollReactor::new();
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fired = Rc::new(Cell::new(0));

        let count = Rc::clone(&fired);
        let handle = from
            .on_readable(rx.as_raw_fd(), Box::new(move |_| count.set(count.get() + 1)))
            .expect("register");

        from.transfer(&to);
        assert_eq!(from.readable_count(), 0);
        assert_eq!(to.readable_count(), 1);

        tx.write_all(b"x").expect("write");
        to.iter(false);
        assert_eq!(fired.get(), 1);

        // The original handle stops the moved registration.
        handle.stop();
        assert_eq!(to.readable_count(), 0);
        tx.write_all(b"y").expect("write");
        to.iter(false);
        assert_eq!(fired.get(), 1);
    }
}
