//! The stack-switching primitive, treated as an external black box per spec §1.
//!
//! [`corosensei::Coroutine`] provides exactly the `resume()`/`yield()` contract the
//! design asks for: full-stack save/restore, no async/await machinery. Everything in
//! this module is a thin, typed wrapper around it plus the thread-local plumbing that
//! lets free functions deep in user code (`yield_now`, `sleep`, the `io` wrappers,
//! `select_any!`) reach the currently-running routine's suspend point without the
//! caller having to thread a context object through every call — mirroring how the
//! original source's routines reach a thread-local "current routine" pointer.

use std::cell::RefCell;
use std::rc::Rc;

use corosensei::{Coroutine, CoroutineResult, Yielder};

use super::{HappenedType, Routine};
use crate::scheduler::thread::SchedulerThreadInner;

/// What a routine's body hands back to the scheduler when it suspends.
#[derive(Debug, Clone, Copy)]
pub enum Suspend {
    /// Explicit `yield_now()`: reschedule at the back of the ready queue.
    Yield,
    /// A single-branch, no-timeout I/O wait (the fast path that enables the
    /// `is_same_as_previous_event` optimization of spec §4.3).
    WaitSysRead { fd: std::os::unix::io::RawFd },
    WaitSysWrite { fd: std::os::unix::io::RawFd },
    /// A committed `select_any` round (includes timers, semaphores, mutexes, multi-
    /// branch I/O, and any I/O wait that also carries a timeout).
    WaitEvents,
}

/// What the scheduler hands back to a routine's body when resuming it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeInfo {
    /// Index of the branch that fired, for a routine resumed out of `WaitEvents`.
    /// Meaningless (and ignored) for routines resumed out of `WaitSysRead`/`WaitSysWrite`,
    /// where there is exactly one implicit branch.
    pub happened_index: usize,
    pub happened_type: Option<HappenedType>,
    /// Set when this wake was caused by `fd_panic` / an error readiness bit rather than
    /// ordinary success.
    pub panic: bool,
}

pub(crate) type Coro = Coroutine<ResumeInfo, Suspend, ()>;

/// Wraps the coroutine so `Routine` doesn't need to name `corosensei` types directly.
pub struct RoutineContext {
    coro: Coro,
}

impl std::fmt::Debug for RoutineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineContext").finish_non_exhaustive()
    }
}

/// What `Coroutine::resume` reported, translated into the vocabulary `RoutineStatus`
/// uses.
pub enum StepOutcome {
    Yielded(Suspend),
    Finished,
}

impl RoutineContext {
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let coro = Coroutine::new(move |yielder: &Yielder<ResumeInfo, Suspend>, _first: ResumeInfo| {
            CURRENT_YIELDER.with(|cell| {
                *cell.borrow_mut() = Some(yielder as *const _ as *const ());
            });
            task();
            CURRENT_YIELDER.with(|cell| {
                *cell.borrow_mut() = None;
            });
        });
        Self { coro }
    }

    /// Resumes the routine's stack. `info` is the wake payload for whichever `Suspend`
    /// point it last parked at; ignored on the very first resume.
    pub fn step(&mut self, info: ResumeInfo) -> StepOutcome {
        match self.coro.resume(info) {
            CoroutineResult::Yield(suspend) => StepOutcome::Yielded(suspend),
            CoroutineResult::Return(()) => StepOutcome::Finished,
        }
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.coro.started()
    }
}

thread_local! {
    /// Type-erased pointer to the `Yielder` of whichever routine is currently running
    /// on this OS thread. Valid only for the duration of one `RoutineContext::step`
    /// call; the scheduler clears/overwrites it around every resume. Sound because
    /// exactly one coroutine stack executes per OS thread at a time (cooperative, no
    /// real parallelism between a routine's body and its driving scheduler thread).
    static CURRENT_YIELDER: RefCell<Option<*const ()>> = const { RefCell::new(None) };

    /// The routine object currently executing on this OS thread, and a raw pointer to
    /// the scheduler-thread-local structures (event loop, timer map, slot arena) it may
    /// register interest into while still "running" (before it actually suspends).
    pub(crate) static CURRENT: RefCell<Option<CurrentRoutineCtx>> = const { RefCell::new(None) };
}

#[derive(Clone)]
pub(crate) struct CurrentRoutineCtx {
    pub routine: Rc<RefCell<Routine>>,
    pub thread: *mut SchedulerThreadInner,
}

/// Suspends the currently-running routine, returning the info it is resumed with.
///
/// # Panics
/// Panics if called from outside a routine's body — mirrors the spec's "callable only
/// from within a routine" rule for every suspension point.
pub fn suspend_current(point: Suspend) -> ResumeInfo {
    let raw = CURRENT_YIELDER.with(|cell| {
        cell.borrow()
            .expect("suspend_current called outside a running routine")
    });
    // SAFETY: `raw` was stashed from a live `&Yielder<ResumeInfo, Suspend>` at the start
    // of this exact coroutine's body and is only ever read while that coroutine is the
    // one running (single-threaded reentrancy guaranteed by the cooperative scheduler).
    let yielder = unsafe { &*raw.cast::<Yielder<ResumeInfo, Suspend>>() };
    yielder.suspend(point)
}

/// Runs `f` with access to the routine + home-thread context of the routine currently
/// executing on this OS thread.
///
/// # Panics
/// Panics if called from outside a routine's body.
pub(crate) fn with_current<R>(f: impl FnOnce(&CurrentRoutineCtx) -> R) -> R {
    CURRENT.with(|cell| {
        let guard = cell.borrow();
        let ctx = guard
            .as_ref()
            .expect("runtime API called outside a running routine");
        f(ctx)
    })
}
