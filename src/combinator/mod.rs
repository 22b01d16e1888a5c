//! Combinators over promises.
//!
//! This module provides the promise algebra:
//!
//! - sequencing: [`Promise::bind`], [`Promise::map`], [`catch`],
//!   [`try_bind`], [`finalize`];
//! - racing: [`choose`], [`pick`];
//! - parallel composition: [`join`], [`nchoose`], [`npick`],
//!   [`nchoose_split`].
//!
//! Already-terminal inputs short-circuit without allocating a pending node
//! where possible. Panics inside user callbacks are captured and become
//! rejections, so one faulty callback cannot unwind the scheduler. The
//! dynamic context captured at combinator-call time is reinstalled around
//! every downstream user function.
//!
//! [`Promise::bind`]: crate::promise::Promise::bind
//! [`Promise::map`]: crate::promise::Promise::map

pub mod chain;
pub mod join;
pub mod select;

pub use chain::{catch, finalize, try_bind};
pub use join::join;
pub use select::{choose, nchoose, nchoose_split, npick, pick};
