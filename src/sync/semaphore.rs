//! Counting semaphore (spec §3, §4.6), grounded on `semaphore.h`'s `wait()`/`post()`
//! pair and its `waiters_` queue of tickets rather than raw routine pointers.
//!
//! The counter is a single signed atomic: non-negative means that many permits are
//! available, negative means that many routines are queued waiting for one. A waiter
//! never blocks the OS thread — it decrements the counter, and if that put the counter
//! below zero, parks the calling routine and registers a [`WaiterTicket`] so a future
//! `post()` (possibly from a different OS thread) knows which thread and slot to wake.
//!
//! `select_any` branches on a semaphore need a third option beyond "acquired" /
//! "parked": "parked, then retracted before anything woke it" (a sibling branch won
//! instead). Each ticket therefore carries a small tri-state flag so `post()` and a
//! retracting branch can race safely: whichever side wins the compare-exchange decides
//! whether the permit was actually handed out or needs to be put back.

use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use std::sync::Arc;

use crate::engine::ThreadRouters;
use crate::queue::WfQueue;
use crate::routine::{suspend_current, HappenedType, SlotIndex, Suspend, ThreadId};
use crate::scheduler::{command::Command, with_inner};

const TICKET_PENDING: u8 = 0;
const TICKET_CONSUMED: u8 = 1;
const TICKET_CANCELLED: u8 = 2;

/// A ticket left in a semaphore's waiter queue: enough for `post()` to route a wake
/// back to the correct home thread without ever touching the waiting routine itself.
struct WaiterTicket {
    home_thread: ThreadId,
    slot: SlotIndex,
    state: Arc<AtomicU8>,
}

struct SemaphoreInner {
    count: AtomicIsize,
    waiters: WfQueue<WaiterTicket>,
    routers: ThreadRouters,
}

/// A counting semaphore with reference-counted, value-semantic handles — cloning a
/// `Semaphore` gives you another handle to the same underlying counter and waiter
/// queue, not a fresh semaphore, mirroring how [`crate::sync::Channel`] handles work.
#[derive(Clone)]
pub struct Semaphore(Arc<SemaphoreInner>);

/// A pending semaphore acquisition registered by a `select_any` branch, returned by
/// [`Semaphore::attempt_acquire`] when no permit was immediately available.
pub(crate) struct PendingAcquire {
    state: Arc<AtomicU8>,
}

pub(crate) enum AcquireAttempt {
    Acquired,
    Pending(PendingAcquire),
}

impl Semaphore {
    pub(crate) fn new(initial: isize, routers: ThreadRouters) -> Self {
        Self(Arc::new(SemaphoreInner {
            count: AtomicIsize::new(initial),
            waiters: WfQueue::new(routers.len().max(1)),
            routers,
        }))
    }

    /// Acquires one permit, suspending the calling routine if none is currently
    /// available.
    ///
    /// # Panics
    /// Panics if called from outside a running routine.
    pub fn wait(&self) {
        if let AcquireAttempt::Pending(_) = self.attempt_acquire(0) {
            let info = suspend_current(Suspend::WaitEvents);
            debug_assert_eq!(info.happened_type, Some(HappenedType::Semaphore));
        }
    }

    /// Non-blocking acquire: takes a permit only if one is immediately available.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        self.0
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then_some(c - 1))
            .is_ok()
    }

    /// Attempts to acquire a permit for a `select_any` branch identified by
    /// `branch_index`. Registers a waiter ticket (and a slot on the calling routine's
    /// home thread) if none is available yet.
    pub(crate) fn attempt_acquire(&self, branch_index: usize) -> AcquireAttempt {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) > 0 {
            return AcquireAttempt::Acquired;
        }
        let (home_thread, slot) = with_inner(|inner| {
            let slot = inner.slot_arena.allocate((with_current_routine(), branch_index));
            (inner.id, slot)
        });
        let state = Arc::new(AtomicU8::new(TICKET_PENDING));
        self.0.waiters.push(WaiterTicket { home_thread, slot, state: Arc::clone(&state) });
        AcquireAttempt::Pending(PendingAcquire { state })
    }

    /// Retracts a branch registered by [`Semaphore::attempt_acquire`] that did not win
    /// its `select_any` round. Returns the permit to the counter unless a concurrent
    /// `post()` already committed it to this ticket, in which case that permit is
    /// forwarded to the next waiter instead of being dropped on the floor.
    pub(crate) fn cancel_pending(&self, pending: &PendingAcquire) {
        match pending.state.compare_exchange(TICKET_PENDING, TICKET_CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(()) => {
                self.0.count.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => self.post(),
        }
    }

    /// Releases one permit, waking the oldest waiting routine if any is queued.
    pub fn post(&self) {
        let previous = self.0.count.fetch_add(1, Ordering::AcqRel);
        if previous >= 0 {
            return;
        }
        loop {
            let ticket = self.pop_waiter_with_patience();
            let Some(ticket) = ticket else {
                debug_assert!(false, "semaphore counter says a waiter exists but none arrived");
                return;
            };
            if ticket.state.compare_exchange(TICKET_PENDING, TICKET_CONSUMED, Ordering::AcqRel, Ordering::Acquire).is_ok()
            {
                self.0.routers.send(ticket.home_thread, Command::ScheduleWaitingRoutine { slot: ticket.slot });
                return;
            }
            // This ticket was already cancelled by its `select_any` branch; its permit
            // is still ours to hand out, so keep looking for a live waiter.
        }
    }

    /// A waiter decremented the counter before us and is in the process of pushing its
    /// ticket; it always completes that push promptly (no suspension points in
    /// between), so a short bounded spin is sufficient rather than a hard error.
    fn pop_waiter_with_patience(&self) -> Option<WaiterTicket> {
        let mut ticket = self.0.waiters.try_pop();
        let mut spins = 0;
        while ticket.is_none() && spins < 1000 {
            std::hint::spin_loop();
            ticket = self.0.waiters.try_pop();
            spins += 1;
        }
        ticket
    }

    #[must_use]
    pub fn available_permits(&self) -> isize {
        self.0.count.load(Ordering::Acquire).max(0)
    }

    /// Wakes every routine currently queued on this semaphore, regardless of how many
    /// that is. Used by [`crate::sync::Channel::close`], where the number of blocked
    /// waiters is not bounded by the channel's capacity and a fixed number of `post()`
    /// calls can strand any waiter past that count.
    ///
    /// Takes a snapshot of the waiter count rather than looping until the counter is
    /// non-negative, so a waiter that arrives after `close()` starts is woken by its own
    /// subsequent `wait()` observing the closed channel, not by this call looping
    /// indefinitely.
    pub(crate) fn wake_all(&self) {
        let pending = (-self.0.count.load(Ordering::Acquire)).max(0);
        for _ in 0..pending {
            self.post();
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore").field("count", &self.0.count.load(Ordering::Relaxed)).finish()
    }
}

fn with_current_routine() -> crate::routine::RoutineHandle {
    crate::routine::with_current(|ctx| ctx.routine.clone())
}
