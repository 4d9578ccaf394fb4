//! The routine status enum and the waiting-descriptor union described in spec §3.

use std::os::unix::io::RawFd;

use crate::event_loop::EventId;
use crate::scheduler::timer::Deadline;

/// A routine's current scheduling status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineStatus {
    New,
    Running,
    Yielding,
    WaitEvents,
    WaitSysRead,
    WaitSysWrite,
    Finished,
}

/// Describes what a suspended routine is waiting on. A discriminated union, matching
/// §3's `io_event{fd, event_id, is_same_as_previous, panic_flag}` / `deadline` /
/// `semaphore_wait_set` cases.
#[derive(Debug, Clone)]
pub enum WaitingDescriptor {
    /// The routine is blocked on exactly one fd (the common single-branch `read`/
    /// `write`/`accept`/`connect`/`send`/`recv` call, not a multi-branch `select_any`).
    IoEvent(IoEventDescriptor),
    /// The routine is blocked in a (possibly multi-branch) `select_any` round. Each
    /// attached branch owns one slot in `Routine::slots`; this variant carries no extra
    /// payload because the slots themselves record per-branch state.
    Events,
}

#[derive(Debug, Clone)]
pub struct IoEventDescriptor {
    pub fd: RawFd,
    pub event_id: Option<EventId>,
    /// True when this registration reuses the same (fd, direction) as the previous
    /// suspend, letting the scheduler skip an unregister/register pair (§4.3).
    pub is_same_as_previous: bool,
    /// Set when the event loop delivered an `fd_panic`/error status rather than plain
    /// readiness.
    pub panic: bool,
}

/// What kind of wait-structure a select branch attached itself to, recorded so the
/// slot's owner can be invalidated or its count adjusted on commit/cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HappenedType {
    Io,
    Timer,
    Semaphore,
}

/// One subscription slot in a routine's most recent `select_any` round.
///
/// `event_index` is this slot's position (`0..k`) among the round's branches;
/// `arena_index` is the stable index the owning structure (timer map, event loop,
/// semaphore waiter queue) was given when the slot was attached, used to mark it
/// invalid without needing to unlink it (design note: "slot invalidation instead of
/// unlinking").
#[derive(Debug, Clone)]
pub struct EventSlot {
    pub event_index: usize,
    pub kind: HappenedType,
    pub deadline: Option<Deadline>,
}
