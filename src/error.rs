//! Error types and rejection values for the promise graph.
//!
//! Rejections are values: a promise that fails carries an [`Error`] with a
//! typed [`ErrorKind`], optional context text, and an optional source chain.
//! Cancellation is the distinguished `Cancelled` kind produced by the
//! cancellation protocol. Panics raised inside user callbacks handed to the
//! combinators are captured and converted into `Panicked` rejections so that
//! one faulty callback cannot unwind the scheduler.
//!
//! Programmer errors (resolving an already-resolved promise, connecting onto
//! a non-pending promise, re-entering the driver) are not represented here;
//! they panic synchronously at the call site.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of rejection carried by an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// The promise was cancelled.
    #[error("promise was cancelled")]
    Cancelled,
    /// A user callback panicked; the payload was captured.
    #[error("user callback panicked")]
    Panicked,
    /// An I/O error surfaced by the reactor.
    #[error("reactor i/o error")]
    Io,
    /// A user-provided error.
    #[error("user error")]
    User,
}

/// The rejection value stored in a rejected promise.
///
/// Cheap to clone: the source chain is reference-counted, so a rejection can
/// be fanned out to every waiter on a promise without duplicating the
/// underlying error.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Creates a cancellation rejection.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates a user rejection with context text.
    #[must_use]
    pub fn user(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(ctx)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this rejection was produced by cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Converts a captured panic payload into a `Panicked` rejection.
    ///
    /// String payloads (the overwhelmingly common case from `panic!` and
    /// `assert!`) are preserved as context; anything else is opaque.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        match message {
            Some(msg) => Self::new(ErrorKind::Panicked).with_context(msg),
            None => Self::new(ErrorKind::Panicked),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(e)
    }
}

/// A specialized Result type for promise operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }
}

/// Runs `f`, converting a panic into a `Panicked` rejection.
///
/// Used at every boundary where user code runs inside the scheduler: the
/// combinators' callbacks, reactor callback dispatch, and exit hooks.
pub(crate) fn catch_rejection<R>(f: impl FnOnce() -> R) -> Result<R> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(Error::from_panic)
}
