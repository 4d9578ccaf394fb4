//! Routines: the user-space green threads scheduled by the engine (spec §3, §4.4).

mod context;
mod id;
mod slot_arena;
mod status;

pub use context::{suspend_current, ResumeInfo, RoutineContext, Suspend};
pub(crate) use context::{with_current, CurrentRoutineCtx, CURRENT};
pub use id::{RoutineId, RoutineIdGenerator, ThreadId};
pub use slot_arena::{SlotArena, SlotIndex};
pub use status::{EventSlot, HappenedType, IoEventDescriptor, RoutineStatus, WaitingDescriptor};

/// A single user-space routine: its identity, where it lives, what it is currently
/// doing, and the suspended coroutine stack that embodies its control flow.
///
/// Owned behind an `Rc<RefCell<_>>` ([`RoutineHandle`]) rather than moved by value,
/// because a routine is referenced from multiple places at once while suspended: its
/// home thread's ready/run bookkeeping, plus one [`EventSlot`] per branch of its most
/// recent `select_any` round. All of those references live on the routine's home
/// thread only — a routine is never touched from any other OS thread directly; cross-
/// thread wakeups travel as [`crate::scheduler::command::Command`] values instead.
#[derive(Debug)]
pub struct Routine {
    pub id: RoutineId,
    pub home_thread: ThreadId,
    pub status: RoutineStatus,
    /// What this routine is blocked on, while `status` is one of the `Wait*` variants.
    pub waiting: Option<WaitingDescriptor>,
    /// One entry per branch of the routine's most recent `select_any` round. Empty
    /// outside of `WaitEvents`.
    pub slots: Vec<EventSlot>,
    /// Set by whichever branch fires, read back by the routine body's select macro arm
    /// on the next resume.
    pub happened_index: usize,
    pub happened_type: Option<HappenedType>,
    /// Set when the winning branch fired as an error/hangup condition rather than
    /// ordinary readiness (delivered back to the routine as `ResumeInfo::panic`).
    pub happened_panic: bool,
    context: RoutineContext,
}

/// Shared handle to a routine. `Rc`, not `Arc`: every live reference is confined to the
/// routine's home OS thread, so atomic refcounting would just be wasted cycles.
pub type RoutineHandle = std::rc::Rc<std::cell::RefCell<Routine>>;

impl Routine {
    pub fn new<F>(id: RoutineId, home_thread: ThreadId, task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id,
            home_thread,
            status: RoutineStatus::New,
            waiting: None,
            slots: Vec::new(),
            happened_index: 0,
            happened_type: None,
            happened_panic: false,
            context: RoutineContext::new(task),
        }
    }

    #[must_use]
    pub fn context_mut(&mut self) -> &mut RoutineContext {
        &mut self.context
    }

    /// Marks branch `index` as the winner of the routine's current select round,
    /// recording what kind of wait-structure it fired from so the caller can decide how
    /// to finish tearing down the other branches.
    pub fn mark_happened(&mut self, index: usize, kind: HappenedType) {
        self.happened_index = index;
        self.happened_type = Some(kind);
        self.happened_panic = false;
    }

    /// As [`Routine::mark_happened`], but for a wake caused by an error/hangup
    /// condition rather than ordinary readiness.
    pub fn mark_happened_panic(&mut self, index: usize, kind: HappenedType) {
        self.happened_index = index;
        self.happened_type = Some(kind);
        self.happened_panic = true;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == RoutineStatus::Finished
    }
}
