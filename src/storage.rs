//! Dynamically scoped key/value storage threaded through promise chains.
//!
//! A [`Key`] is a handle to one storage cell plus a fresh integer identifier.
//! The *current context* is a single thread-local cell holding an immutable
//! map from key identifiers to refresh thunks; [`Key::with_value`] installs
//! an extended map for the duration of a synchronous computation, and the
//! promise graph snapshots the map whenever a combinator is called so that
//! the binding is visible again when a waiter fires on the other side of a
//! suspension point.
//!
//! Restoration is exact: after any scoped installation — including one that
//! unwinds — the current context equals the context that was active before.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Writes the key's value into its storage cell when invoked.
type RefreshFn = Rc<dyn Fn()>;

type Slots = HashMap<usize, RefreshFn>;

thread_local! {
    static CURRENT: RefCell<Rc<Slots>> = RefCell::new(Rc::new(HashMap::new()));
    static NEXT_KEY_ID: Cell<usize> = const { Cell::new(0) };
}

/// An immutable capture of the current context.
///
/// Cheap to clone; snapshots share the underlying map.
#[derive(Clone)]
pub(crate) struct Snapshot(Rc<Slots>);

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("keys", &self.0.len()).finish()
    }
}

/// Captures the current context.
pub(crate) fn snapshot() -> Snapshot {
    CURRENT.with(|c| Snapshot(Rc::clone(&c.borrow())))
}

/// Restores the previously current context when dropped.
struct InstallGuard {
    prev: Rc<Slots>,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = Rc::clone(&self.prev));
    }
}

fn install(map: Rc<Slots>) -> InstallGuard {
    CURRENT.with(|c| {
        let prev = std::mem::replace(&mut *c.borrow_mut(), map);
        InstallGuard { prev }
    })
}

/// Runs `f` with the given snapshot installed as the current context.
pub(crate) fn with_snapshot<R>(snap: &Snapshot, f: impl FnOnce() -> R) -> R {
    let _guard = install(Rc::clone(&snap.0));
    f()
}

/// A handle to one dynamically scoped storage cell.
///
/// Keys are cheap to clone and compare by identity (each call to [`new_key`]
/// produces a fresh identifier).
pub struct Key<V: 'static> {
    id: usize,
    cell: Rc<RefCell<Option<V>>>,
}

impl<V> Clone for Key<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<V> std::fmt::Debug for Key<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("id", &self.id).finish()
    }
}

/// Creates a fresh storage key.
#[must_use]
pub fn new_key<V: 'static>() -> Key<V> {
    let id = NEXT_KEY_ID.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    });
    Key {
        id,
        cell: Rc::new(RefCell::new(None)),
    }
}

impl<V: Clone + 'static> Key<V> {
    /// Reads the key's value in the current context.
    #[must_use]
    pub fn get(&self) -> Option<V> {
        let refresh = CURRENT.with(|c| c.borrow().get(&self.id).cloned());
        match refresh {
            Some(refresh) => {
                refresh();
                self.cell.borrow_mut().take()
            }
            None => None,
        }
    }

    /// Runs `f` with this key bound to `value` (or unbound for `None`).
    ///
    /// The previous context is restored when `f` returns, and also if `f`
    /// unwinds.
    pub fn with_value<R>(&self, value: Option<V>, f: impl FnOnce() -> R) -> R {
        let map = CURRENT.with(|c| {
            let mut slots: Slots = (**c.borrow()).clone();
            match value {
                Some(v) => {
                    let cell = Rc::clone(&self.cell);
                    slots.insert(
                        self.id,
                        Rc::new(move || *cell.borrow_mut() = Some(v.clone())) as RefreshFn,
                    );
                }
                None => {
                    slots.remove(&self.id);
                }
            }
            Rc::new(slots)
        });
        let _guard = install(map);
        f()
    }
}
