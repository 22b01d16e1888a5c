//! Readiness-call fallback reactor built on `poll(2)`.
//!
//! This implementation owns everything itself: two maps from file
//! descriptor to an ordered callback sequence (readable and writable), and
//! the timer min-heap. Each iteration
//!
//! 1. moves newly created timers into the heap,
//! 2. gathers the watched descriptors into a fresh `pollfd` array,
//! 3. computes the timeout from the earliest live deadline (infinite when
//!    there is none, zero when not blocking),
//! 4. performs the readiness call,
//! 5. fires due timers, then
//! 6. fires descriptor callbacks — all readable ones, then all writable
//!    ones, insertion order within a list.
//!
//! Descriptors the kernel reports as invalid (`POLLNVAL`) have their
//! callbacks fired anyway so the owning channel can observe the error and
//! tear itself down.
//!
//! The `pollfd` array is rebuilt from scratch every pass, so the kernel
//! holds no persistent registration state for this reactor — which is what
//! makes it the safe fallback when the platform event library is
//! unavailable or misbehaves.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::timer::{self, StagedTimer, TimerHeap};
use super::{
    dispatch_watchers, move_fd_watcher, move_timer, Direction, EventHandle, FdWatcher, Reactor,
};
use crate::sequence::Sequence;

/// Fallback reactor over `poll(2)`.
pub struct PollReactor {
    inner: Rc<PollInner>,
}

struct PollInner {
    readable: RefCell<HashMap<RawFd, Sequence<FdWatcher>>>,
    writable: RefCell<HashMap<RawFd, Sequence<FdWatcher>>>,
    timers: RefCell<TimerHeap>,
    staged: RefCell<Vec<StagedTimer>>,
}

impl PollReactor {
    /// Creates an empty reactor. Acquires no kernel resources.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(PollInner {
                readable: RefCell::new(HashMap::new()),
                writable: RefCell::new(HashMap::new()),
                timers: RefCell::new(TimerHeap::new()),
                staged: RefCell::new(Vec::new()),
            }),
        }
    }

    fn watch(
        map: &RefCell<HashMap<RawFd, Sequence<FdWatcher>>>,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> EventHandle {
        let seq = map.borrow_mut().entry(fd).or_default().clone();
        let handle = EventHandle::bare();
        let node = seq.push_back(FdWatcher {
            callback: Rc::new(RefCell::new(callback)),
            handle: handle.clone(),
        });
        handle.retarget(Box::new(move || node.remove()));
        handle
    }

    fn dispatch(&self, map: &RefCell<HashMap<RawFd, Sequence<FdWatcher>>>, fd: RawFd) {
        let seq = map.borrow().get(&fd).cloned();
        if let Some(seq) = seq {
            dispatch_watchers(&seq);
        }
    }
}

impl Default for PollReactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds for `poll(2)`, rounded up so a timer is never early.
fn timeout_to_ms(timeout: Duration) -> libc::c_int {
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

impl Reactor for PollReactor {
    fn iter(&self, block: bool) {
        let staged = std::mem::take(&mut *self.inner.staged.borrow_mut());
        self.inner.timers.borrow_mut().absorb(staged);

        let mut interest: BTreeMap<RawFd, libc::c_short> = BTreeMap::new();
        {
            let mut readable = self.inner.readable.borrow_mut();
            readable.retain(|_, seq| !seq.is_empty());
            for fd in readable.keys() {
                *interest.entry(*fd).or_insert(0) |= libc::POLLIN;
            }
        }
        {
            let mut writable = self.inner.writable.borrow_mut();
            writable.retain(|_, seq| !seq.is_empty());
            for fd in writable.keys() {
                *interest.entry(*fd).or_insert(0) |= libc::POLLOUT;
            }
        }
        let mut fds: Vec<libc::pollfd> = interest
            .iter()
            .map(|(fd, events)| libc::pollfd {
                fd: *fd,
                events: *events,
                revents: 0,
            })
            .collect();

        let timeout_ms: libc::c_int = if block {
            match self.inner.timers.borrow_mut().next_deadline() {
                Some(deadline) => {
                    timeout_to_ms(deadline.saturating_duration_since(Instant::now()))
                }
                None => -1,
            }
        } else {
            0
        };

        tracing::trace!(fds = fds.len(), timeout_ms, "poll(2) iteration");
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        let interrupted = if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!(error = %err, "poll(2) failed");
                return;
            }
            true
        } else {
            false
        };

        timer::fire_due(&self.inner.timers);
        if interrupted {
            return;
        }

        for pfd in &fds {
            let bad = pfd.revents & libc::POLLNVAL != 0;
            if bad {
                tracing::debug!(fd = pfd.fd, "poll(2) reported an invalid descriptor");
            }
            if bad || pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                self.dispatch(&self.inner.readable, pfd.fd);
            }
        }
        for pfd in &fds {
            let bad = pfd.revents & libc::POLLNVAL != 0;
            if bad || pfd.revents & (libc::POLLOUT | libc::POLLERR) != 0 {
                self.dispatch(&self.inner.writable, pfd.fd);
            }
        }
    }

    fn on_readable(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle> {
        Ok(Self::watch(&self.inner.readable, fd, callback))
    }

    fn on_writable(
        &self,
        fd: RawFd,
        callback: Box<dyn FnMut(&EventHandle)>,
    ) -> io::Result<EventHandle> {
        Ok(Self::watch(&self.inner.writable, fd, callback))
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
        self.dispatch(&self.inner.readable, fd);
        self.dispatch(&self.inner.writable, fd);
    }

    fn readable_count(&self) -> usize {
        self.inner.readable.borrow().values().map(Sequence::len).sum()
    }

    fn writable_count(&self) -> usize {
        self.inner.writable.borrow().values().map(Sequence::len).sum()
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
        let readable: Vec<_> = self.inner.readable.borrow_mut().drain().collect();
        for (fd, seq) in readable {
            for watcher in seq.take_all() {
                if watcher.handle.is_active() {
                    move_fd_watcher(other, fd, &watcher, Direction::Read);
                }
            }
        }
        let writable: Vec<_> = self.inner.writable.borrow_mut().drain().collect();
        for (fd, seq) in writable {
            for watcher in seq.take_all() {
                if watcher.handle.is_active() {
                    move_fd_watcher(other, fd, &watcher, Direction::Write);
                }
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
        let readable: Vec<_> = self.inner.readable.borrow_mut().drain().collect();
        for (_, seq) in readable {
            for watcher in seq.take_all() {
                watcher.handle.stop();
            }
        }
        let writable: Vec<_> = self.inner.writable.borrow_mut().drain().collect();
        for (_, seq) in writable {
            for watcher in seq.take_all() {
                watcher.handle.stop();
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

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("readable", &self.readable_count())
            .field("writable", &self.writable_count())
            .field("timers", &self.timer_count())
            .finish()
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
    fn readable_callback_fires_when_data_arrives() {
        let reactor = PollReactor::new();
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fired = Rc::new(Cell::new(0));

        let count = Rc::clone(&fired);
        reactor
            .on_readable(rx.as_raw_fd(), Box::new(move |_| count.set(count.get() + 1)))
            .expect("register");

        reactor.iter(false);
        assert_eq!(fired.get(), 0);

        tx.write_all(b"x").expect("write");
        reactor.iter(false);
        assert_eq!(fired.get(), 1);

        // Level-triggered: unread data keeps firing.
        reactor.iter(false);
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn stopped_watcher_no_longer_fires() {
        let reactor = PollReactor::new();
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fired = Rc::new(Cell::new(0));

        let count = Rc::clone(&fired);
        let handle = reactor
            .on_readable(rx.as_raw_fd(), Box::new(move |_| count.set(count.get() + 1)))
            .expect("register");
        tx.write_all(b"x").expect("write");

        handle.stop();
        handle.stop();
        assert_eq!(reactor.readable_count(), 0);
        reactor.iter(false);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn callback_can_stop_itself() {
        let reactor = PollReactor::new();
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fired = Rc::new(Cell::new(0));

        let count = Rc::clone(&fired);
        reactor
            .on_readable(
                rx.as_raw_fd(),
                Box::new(move |handle| {
                    count.set(count.get() + 1);
                    handle.stop();
                }),
            )
            .expect("register");
        tx.write_all(b"x").expect("write");

        reactor.iter(false);
        reactor.iter(false);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn timer_fires_after_its_delay() {
        let reactor = PollReactor::new();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        reactor
            .on_timer(
                Duration::from_millis(10),
                false,
                Box::new(move |_| flag.set(true)),
            )
            .expect("register");

        reactor.iter(false);
        assert!(!fired.get());

        std::thread::sleep(Duration::from_millis(15));
        reactor.iter(false);
        assert!(fired.get());
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn blocking_iter_wakes_for_a_timer() {
        let reactor = PollReactor::new();
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
    fn repeating_timer_fires_until_stopped() {
        let reactor = PollReactor::new();
        let fired = Rc::new(Cell::new(0));
        let count = Rc::clone(&fired);
        let handle = reactor
            .on_timer(
                Duration::from_millis(5),
                true,
                Box::new(move |_| count.set(count.get() + 1)),
            )
            .expect("register");

        std::thread::sleep(Duration::from_millis(8));
        reactor.iter(false);
        assert_eq!(fired.get(), 1);

        std::thread::sleep(Duration::from_millis(8));
        reactor.iter(false);
        assert_eq!(fired.get(), 2);

        handle.stop();
        std::thread::sleep(Duration::from_millis(8));
        reactor.iter(false);
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn fake_io_fires_both_directions_without_the_kernel() {
        let reactor = PollReactor::new();
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
    fn invalid_descriptor_callbacks_are_fired() {
        let reactor = PollReactor::new();
        let bad_fd = {
            let (_a, b) = UnixStream::pair().expect("socket pair");
            b.as_raw_fd()
            // both ends dropped here: the fd is closed
        };
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        reactor
            .on_readable(bad_fd, Box::new(move |_| flag.set(true)))
            .expect("register");

        reactor.iter(false);
        assert!(fired.get());
    }

    #[test]
    fn panicking_callback_does_not_stop_the_iteration() {
        let reactor = PollReactor::new();
        let (mut tx, rx) = UnixStream::pair().expect("socket pair");
        let fd = rx.as_raw_fd();
        let fired = Rc::new(Cell::new(false));

        reactor
            .on_readable(fd, Box::new(|_| panic!("faulty callback")))
            .expect("register");
        let flag = Rc::clone(&fired);
        reactor
            .on_readable(fd, Box::new(move |_| flag.set(true)))
            .expect("register");

        tx.write_all(b"x").expect("write");
        reactor.iter(false);
        assert!(fired.get());
    }
}
