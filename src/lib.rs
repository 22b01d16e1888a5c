//! Lilt: cooperative promises with an explicit scheduler.
//!
//! # Overview
//!
//! Lilt is the core of a cooperative lightweight-thread library: a
//! value-carrying deferred type ([`Promise`]) with the algebra of
//! combinators over it, a first-class cancellation protocol, a dynamically
//! scoped key/value store that follows promise chains across suspension
//! points, and a pluggable reactor driving file-descriptor readiness and
//! timers.
//!
//! # Core Guarantees
//!
//! - **Sticky terminals**: a resolved or rejected promise never changes
//!   state again, and every waiter fires at most once.
//! - **Cancel-correctness**: cancellation is delivered at most once,
//!   propagates backwards through combinator chains, and converges
//!   silently with a racing resolution.
//! - **Flat forwarding**: promise forwarding is path-compressed union-find;
//!   tail-recursive `bind` loops run in constant space.
//! - **Bounded stacks**: deferred wakeups drain at the top of the
//!   triggering call stack instead of recursing.
//! - **Context restoration**: the dynamic context around any waiter firing
//!   is saved and restored exactly.
//! - **Deterministic tie-breaking**: racing combinators use a fixed-seed
//!   PRNG, so non-I/O-driven programs are reproducible.
//!
//! # Module Structure
//!
//! - [`promise`]: the promise graph — states, forwarding, cancellation,
//!   pausing
//! - [`combinator`]: bind/map/catch/try_bind/finalize, choose/pick, join,
//!   and the n-ary variants
//! - [`storage`]: dynamically scoped keys
//! - [`reactor`]: the reactor trait and its two implementations
//! - [`driver`]: the main loop and exit hooks
//! - [`sequence`]: intrusive sequence with O(1) handle-based removal
//! - [`error`]: rejection values
//! - [`util`]: deterministic RNG
//! - [`test_utils`]: tracing-based test logging
//!
//! # Threading Model
//!
//! Single-threaded and cooperative. Handles are `!Send`; scheduler state is
//! thread-local; the only suspension points are waiter firings and reactor
//! iterations. User functions handed to combinators run to completion
//! before any other promise makes progress.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod combinator;
pub mod driver;
pub mod error;
pub mod promise;
pub mod reactor;
pub mod sequence;
pub mod storage;
pub mod test_utils;
pub mod util;

pub use combinator::{catch, choose, finalize, join, nchoose, nchoose_split, npick, pick, try_bind};
pub use driver::{at_exit, run, run_exit_hooks};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use promise::{
    pause, paused_count, protected, register_pause_notifier, wakeup_paused, Promise, PromiseState,
    Resolver,
};
pub use reactor::{EventHandle, PollReactor, PollerReactor, Reactor};
pub use sequence::{Node, Sequence};
pub use storage::{new_key, Key};
