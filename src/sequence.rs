//! Intrusive doubly-linked sequence with stable node handles.
//!
//! A [`Sequence`] keeps its elements in insertion order and hands out a
//! [`Node`] for every insertion. A node can be removed in O(1) given only the
//! handle, which is what makes the sequence suitable for stop-tokens: the
//! paused-promise queue and the reactors' per-descriptor callback lists are
//! all sequences whose nodes are unlinked when a watcher is stopped.
//!
//! The sequence is single-threaded; handles share the list through `Rc` and
//! interior mutability. Back-links and owner pointers are weak, so dropping
//! the list (or the last handle to a node) releases everything.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

struct RawNode<T> {
    /// `None` once the value has been moved out by `take_all`.
    value: Option<T>,
    prev: Option<Weak<RefCell<RawNode<T>>>>,
    next: Option<Rc<RefCell<RawNode<T>>>>,
    /// `None` once the node is detached.
    owner: Option<Weak<RefCell<SeqState<T>>>>,
}

struct SeqState<T> {
    head: Option<Rc<RefCell<RawNode<T>>>>,
    tail: Option<Weak<RefCell<RawNode<T>>>>,
    len: usize,
}

/// An ordered sequence with O(1) append and O(1) handle-based removal.
pub struct Sequence<T> {
    state: Rc<RefCell<SeqState<T>>>,
}

/// A stable handle to one element of a [`Sequence`].
pub struct Node<T> {
    raw: Rc<RefCell<RawNode<T>>>,
}

impl<T> Clone for Sequence<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            raw: Rc::clone(&self.raw),
        }
    }
}

impl<T> Default for Sequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Sequence<T> {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SeqState {
                head: None,
                tail: None,
                len: 0,
            })),
        }
    }

    /// Returns the number of attached elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().len
    }

    /// Returns true if the sequence holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a value and returns its node handle.
    pub fn push_back(&self, value: T) -> Node<T> {
        let raw = Rc::new(RefCell::new(RawNode {
            value: Some(value),
            prev: None,
            next: None,
            owner: None,
        }));
        self.attach_back(&raw);
        Node { raw }
    }

    /// Links a detached raw node at the back of this sequence.
    fn attach_back(&self, raw: &Rc<RefCell<RawNode<T>>>) {
        {
            let mut n = raw.borrow_mut();
            n.owner = Some(Rc::downgrade(&self.state));
            n.prev = None;
            n.next = None;
        }
        let mut st = self.state.borrow_mut();
        match st.tail.take().and_then(|w| w.upgrade()) {
            Some(tail) => {
                raw.borrow_mut().prev = Some(Rc::downgrade(&tail));
                tail.borrow_mut().next = Some(Rc::clone(raw));
            }
            None => st.head = Some(Rc::clone(raw)),
        }
        st.tail = Some(Rc::downgrade(raw));
        st.len += 1;
    }

    /// Node handles of the attached elements, in insertion order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node<T>> {
        let mut out = Vec::with_capacity(self.len());
        let mut cur = self.state.borrow().head.clone();
        while let Some(node) = cur {
            out.push(Node {
                raw: Rc::clone(&node),
            });
            cur = node.borrow().next.clone();
        }
        out
    }

    /// Detaches every element and moves the values out, in insertion order.
    pub fn take_all(&self) -> Vec<T> {
        let (mut cur, len) = {
            let mut st = self.state.borrow_mut();
            let head = st.head.take();
            st.tail = None;
            let len = st.len;
            st.len = 0;
            (head, len)
        };
        let mut out = Vec::with_capacity(len);
        while let Some(node) = cur {
            let mut n = node.borrow_mut();
            n.owner = None;
            n.prev = None;
            if let Some(v) = n.value.take() {
                out.push(v);
            }
            cur = n.next.take();
        }
        out
    }

    /// Detaches every element, dropping the values.
    pub fn clear(&self) {
        drop(self.take_all());
    }

    /// Moves all elements to the back of `other`, preserving order.
    ///
    /// Node handles stay valid and now unlink from `other`.
    pub fn transfer_to(&self, other: &Self) {
        if Rc::ptr_eq(&self.state, &other.state) {
            return;
        }
        let mut cur = {
            let mut st = self.state.borrow_mut();
            let head = st.head.take();
            st.tail = None;
            st.len = 0;
            head
        };
        while let Some(node) = cur {
            let next = {
                let mut n = node.borrow_mut();
                n.owner = None;
                n.prev = None;
                n.next.take()
            };
            other.attach_back(&node);
            cur = next;
        }
    }
}

impl<T: Clone> Sequence<T> {
    /// Values of the attached elements, in insertion order.
    ///
    /// The snapshot is taken eagerly, so the list may be mutated while the
    /// caller walks it; pair with [`Node::get`] to skip elements detached
    /// mid-walk.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        let mut cur = self.state.borrow().head.clone();
        while let Some(node) = cur {
            let n = node.borrow();
            if let Some(v) = &n.value {
                out.push(v.clone());
            }
            cur = n.next.clone();
        }
        out
    }
}

impl<T> Node<T> {
    /// Returns true while the node is linked into a sequence.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.raw.borrow().owner.is_some()
    }

    /// Unlinks the node from its sequence. Idempotent, O(1).
    pub fn remove(&self) {
        let owner = self.raw.borrow_mut().owner.take();
        let Some(owner) = owner else { return };
        let Some(owner) = owner.upgrade() else {
            // The list is gone; just sever the links.
            let mut n = self.raw.borrow_mut();
            n.prev = None;
            n.next = None;
            return;
        };
        let (prev, next) = {
            let mut n = self.raw.borrow_mut();
            (n.prev.take(), n.next.take())
        };
        let mut st = owner.borrow_mut();
        let prev_rc = prev.as_ref().and_then(Weak::upgrade);
        match &prev_rc {
            Some(p) => p.borrow_mut().next = next.clone(),
            None => st.head = next.clone(),
        }
        match &next {
            Some(nx) => nx.borrow_mut().prev = prev,
            None => st.tail = prev_rc.as_ref().map(Rc::downgrade),
        }
        st.len -= 1;
    }
}

impl<T: Clone> Node<T> {
    /// The element's value, or `None` once the node is detached.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        let n = self.raw.borrow();
        if n.owner.is_some() {
            n.value.clone()
        } else {
            None
        }
    }
}

impl<T> std::fmt::Debug for Sequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence").field("len", &self.len()).finish()
    }
}

impl<T> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("attached", &self.is_attached())
            .finish()
    }
}
