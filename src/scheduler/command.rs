//! Cross-thread commands carried over a [`crate::queue::WfQueue`] into a scheduler
//! thread's inbound queue (spec §4.7), grounded on `internal/thread.cc`'s
//! `engine_proxy` push methods and `handle_engine_event`'s dispatch switch.
//!
//! A routine's state never leaves its home thread. Anything another thread needs to
//! tell it — "you're runnable now", "a new routine should start here", "this fd is
//! being torn down", "stop for good" — travels as one of these instead.

use std::os::unix::io::RawFd;

use crate::routine::{RoutineHandle, SlotIndex};

pub enum Command {
    /// Places a brand-new routine onto this thread's ready queue. Used both for
    /// `start_on(thread, task)` and for the engine's round-robin placement policy.
    AddRoutine(RoutineHandle),

    /// Wakes a routine suspended on a semaphore/mutex from another thread: the posting
    /// thread only has a `(home_thread, slot_index)` ticket, never the routine itself,
    /// so this is the one place a foreign thread's action turns back into a local
    /// `RoutineHandle` lookup (via the home thread's `SlotArena`).
    ScheduleWaitingRoutine { slot: SlotIndex },

    /// Forces every wait on `fd` to wake with an interrupted/error result, used by
    /// `Engine::fd_panic` when a caller knows an fd is about to become invalid (closed
    /// by another part of the program) and wants in-flight waiters unblocked instead of
    /// hanging until some unrelated readiness event.
    FdPanic { fd: RawFd },

    /// Tells this thread it may exit its main loop. Only ever sent by
    /// [`crate::engine::Engine::shutdown`] after it has confirmed, via the engine's
    /// shared live-routine counter, that every routine spawned anywhere in the engine
    /// (not just on this thread) has already finished — so by the time a thread drains
    /// this command, no sibling thread can still be mid-`spawn`/`spawn_on` a new
    /// routine onto it. Draining it is enough to stop; no further bookkeeping needed.
    Shutdown,
}
