//! Crate-wide error type.
//!
//! Most runtime operations (I/O wrappers, channel/semaphore ops) report failure via the
//! POSIX-flavored sentinels described in the crate root docs (negative `errno`,
//! `success: bool`) rather than this type — [`RuntimeError`] is reserved for failures in
//! the scaffolding itself: engine setup, thread spawn, and the invariant violations that
//! §7 of the design calls fatal.

use std::fmt;

/// Errors raised by the engine/scheduler scaffolding.
///
/// Each variant is a distinct failure mode with its own message, mirroring how the
/// teacher's `SubscribeError` separates causes rather than collapsing them into one
/// stringly-typed error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// [`std::thread::Builder::spawn`] failed, typically because of OS thread limits.
    #[error("failed to spawn scheduler thread {thread_index}: {source}")]
    ThreadSpawn {
        thread_index: usize,
        #[source]
        source: std::io::Error,
    },

    /// The readiness facility (`mio::Poll`) could not be created or configured.
    #[error("failed to initialize the event loop on thread {thread_index}: {source}")]
    EventLoopInit {
        thread_index: usize,
        #[source]
        source: std::io::Error,
    },

    /// A syscall on the readiness facility returned an error class the design treats as
    /// fatal (`EFAULT`/`EINVAL`), i.e. API misuse rather than a transient condition.
    #[error("fatal readiness-facility syscall error: {0}")]
    ReadinessFacilityMisuse(String),

    /// An internal invariant was violated (e.g. the ready queue is empty while
    /// suspended routines remain and no command is pending). This always indicates a
    /// bug in the runtime itself, never in user routines.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// `Engine::run` was called with zero scheduler threads.
    #[error("an engine requires at least one scheduler thread")]
    NoThreads,
}

/// Convenience alias for fallible runtime-construction operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Panics with a `tracing::error!` emitted first, so the diagnostic survives even if the
/// panic unwinds past whatever is subscribed to the log.
///
/// Grounded on the design's §7 rule that fatal kinds (syscall misuse, invariant
/// violation) abort loudly rather than limping on with corrupted scheduler state.
#[track_caller]
pub(crate) fn fatal(err: RuntimeError) -> ! {
    tracing::error!(error = %err, "fatal runtime error");
    panic!("{err}");
}

/// A lightweight POSIX-style status used by I/O wrappers and select branches: either a
/// non-negative return code or a negative `errno`-style sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// `-ETIMEDOUT`, returned by I/O wrappers and the timeout branch of an internal select.
pub const ETIMEDOUT_SENTINEL: isize = -(libc::ETIMEDOUT as isize);

/// `-EINTR`, returned when a routine's fd is woken by [`crate::engine::Engine::fd_panic`].
pub const EINTR_SENTINEL: isize = -(libc::EINTR as isize);

/// `-EBADF`, returned when a panicked fd turns out to already be invalid.
pub const EBADF_SENTINEL: isize = -(libc::EBADF as isize);
