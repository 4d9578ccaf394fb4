//! One scheduler OS thread: ready queue, readiness facility, timer map and slot arena,
//! all thread-local by construction. Grounded on `internal/thread.cc`'s
//! `execute_scheduled_routines` loop and `handle_engine_event` dispatch, and on the
//! teacher's `resilient_reactor_thread` for the mio event-loop-driven thread shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::Waker;
use tracing::{debug, trace, warn};

use super::command::Command;
use super::timer::TimerMap;
use crate::error::{fatal, RuntimeError};
use crate::event_loop::{EventLoop, Readiness};
use crate::queue::WfQueue;
use crate::routine::{
    with_current, CurrentRoutineCtx, HappenedType, ResumeInfo, RoutineHandle, RoutineStatus, SlotArena,
    StepOutcome, Suspend, ThreadId,
};

/// Everything a routine running on this thread may reach through
/// [`crate::routine::with_current`] while it is "running" but before it has actually
/// suspended (registering a read interest, arming a timer, and so on).
pub struct SchedulerThreadInner {
    pub(crate) id: ThreadId,
    ready: VecDeque<RoutineHandle>,
    pub(crate) event_loop: EventLoop,
    pub(crate) timers: TimerMap,
    pub(crate) slot_arena: SlotArena<(RoutineHandle, usize)>,
    inbound: Arc<WfQueue<Command>>,
    /// Shared across every thread in the engine (see [`crate::engine::Engine`]):
    /// incremented by `Engine::spawn`/`spawn_on` before a routine's `AddRoutine`
    /// command is even pushed, decremented here when a routine finishes. `shutdown`
    /// only sends `Command::Shutdown` once this reads zero, so a thread can never be
    /// told to stop while a sibling thread might still be placing new work on it.
    live_routines: Arc<AtomicUsize>,
    shutting_down: bool,
}

impl SchedulerThreadInner {
    fn new(id: ThreadId, event_loop: EventLoop, inbound: Arc<WfQueue<Command>>, live_routines: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            ready: VecDeque::new(),
            event_loop,
            timers: TimerMap::new(),
            slot_arena: SlotArena::new(),
            inbound,
            live_routines,
            shutting_down: false,
        }
    }

    pub(crate) fn push_ready(&mut self, routine: RoutineHandle) {
        routine.borrow_mut().status = RoutineStatus::Yielding;
        self.ready.push_back(routine);
    }

    fn drain_inbound(&mut self) {
        while let Some(command) = self.inbound.try_pop() {
            match command {
                Command::AddRoutine(routine) => {
                    self.push_ready(routine);
                }
                Command::ScheduleWaitingRoutine { slot } => {
                    if let Some((routine, branch_index)) = self.slot_arena.free(slot) {
                        if routine.borrow().status == RoutineStatus::WaitEvents {
                            routine.borrow_mut().mark_happened(branch_index, HappenedType::Semaphore);
                            self.push_ready(routine);
                        } else {
                            trace!(
                                thread = %self.id,
                                "ignored semaphore wake for a routine already claimed by a sibling branch"
                            );
                        }
                    } else {
                        trace!(thread = %self.id, "ignored wake for an already-retracted slot");
                    }
                }
                Command::FdPanic { fd } => self.panic_fd(fd),
                Command::Shutdown => {
                    debug!(thread = %self.id, "shutdown command received; exiting once drained");
                    self.shutting_down = true;
                }
            }
        }
    }

    /// Forces every registration on `fd` to wake as interrupted, per
    /// [`crate::engine::Engine::fd_panic`].
    fn panic_fd(&mut self, fd: std::os::unix::io::RawFd) {
        warn!(fd, "fd_panic requested; matching registrations will wake as interrupted");
        for id in self.event_loop.registrations_on(fd) {
            self.wake_from_event(id, Readiness::Interrupted);
        }
    }

    fn wake_from_event(&mut self, id: crate::event_loop::EventId, readiness: Readiness) {
        let Some((routine, branch_index)) = self.event_loop.registration(id) else { return };
        let panic = matches!(readiness, Readiness::Interrupted);
        if let Err(err) = self.event_loop.unregister(id) {
            warn!(thread = %self.id, fd = id.fd(), error = %err, "failed to unregister fd after dispatch");
        }
        let still_waiting = {
            let mut r = routine.borrow_mut();
            let still_waiting = matches!(
                r.status,
                RoutineStatus::WaitEvents | RoutineStatus::WaitSysRead | RoutineStatus::WaitSysWrite
            );
            if still_waiting {
                if panic {
                    r.mark_happened_panic(branch_index, HappenedType::Io);
                } else {
                    r.mark_happened(branch_index, HappenedType::Io);
                }
                r.waiting = None;
            }
            still_waiting
        };
        if still_waiting {
            self.push_ready(routine);
        }
    }

    fn fire_due_timers(&mut self) {
        for (_, entry) in self.timers.pop_due() {
            let still_waiting = entry.routine.borrow().status == RoutineStatus::WaitEvents;
            if still_waiting {
                entry.routine.borrow_mut().mark_happened(entry.branch_index, HappenedType::Timer);
                self.push_ready(entry.routine);
            }
        }
    }

    /// Runs routines until the ready queue drains, then blocks on the readiness
    /// facility (bounded by the soonest pending timer) for more work. Returns `false`
    /// once a `Command::Shutdown` has been drained, telling the caller to stop calling
    /// this method. By the time that command arrives the engine has already confirmed
    /// every routine anywhere in the engine has finished, so the ready queue is
    /// guaranteed empty here too.
    pub(crate) fn run_iteration(&mut self) -> bool {
        self.drain_inbound();
        if self.shutting_down {
            return false;
        }
        self.fire_due_timers();

        while let Some(routine) = self.ready.pop_front() {
            self.step_routine(routine);
            self.drain_inbound();
            if self.shutting_down {
                return false;
            }
        }

        let timeout = self.timers.next_timeout();
        match self.event_loop.run_once(timeout) {
            Ok(fired) => {
                for (id, readiness) in fired {
                    self.wake_from_event(id, readiness);
                }
            }
            Err(err) => warn!(thread = %self.id, error = %err, "readiness poll failed"),
        }
        true
    }

    fn step_routine(&mut self, routine: RoutineHandle) {
        let resume_info = {
            let r = routine.borrow();
            ResumeInfo {
                happened_index: r.happened_index,
                happened_type: r.happened_type,
                panic: r.happened_panic,
            }
        };
        routine.borrow_mut().status = RoutineStatus::Running;

        let ctx = CurrentRoutineCtx { routine: routine.clone(), thread: std::ptr::from_mut(self) };
        crate::routine::CURRENT.with(|cell| *cell.borrow_mut() = Some(ctx));
        let outcome = routine.borrow_mut().context_mut().step(resume_info);
        crate::routine::CURRENT.with(|cell| *cell.borrow_mut() = None);

        match outcome {
            StepOutcome::Finished => {
                routine.borrow_mut().status = RoutineStatus::Finished;
                debug!(thread = %self.id, "routine finished");
                self.live_routines.fetch_sub(1, Ordering::SeqCst);
            }
            StepOutcome::Yielded(Suspend::Yield) => {
                self.push_ready(routine);
            }
            StepOutcome::Yielded(Suspend::WaitSysRead { fd }) => {
                routine.borrow_mut().status = RoutineStatus::WaitSysRead;
                self.register_io(fd, true, false, routine);
            }
            StepOutcome::Yielded(Suspend::WaitSysWrite { fd }) => {
                routine.borrow_mut().status = RoutineStatus::WaitSysWrite;
                self.register_io(fd, false, true, routine);
            }
            StepOutcome::Yielded(Suspend::WaitEvents) => {
                routine.borrow_mut().status = RoutineStatus::WaitEvents;
                // Branches were already attached to the event loop/timer map/semaphore
                // queues during the routine's own code, before it called
                // `suspend_current`; nothing more to do here.
            }
        }
    }

    /// Registers the fast I/O path's read/write interest. A failure here means the
    /// readiness facility itself rejected the registration (`EFAULT`/`EINVAL`/`ENOMEM`
    /// and the like) — genuine API misuse, not the benign "fd already registered for
    /// the other direction" case, which `EventLoop::register` coalesces internally —
    /// so per §7 this is fatal rather than leaving the routine parked on nothing.
    fn register_io(&mut self, fd: std::os::unix::io::RawFd, readable: bool, writable: bool, routine: RoutineHandle) {
        if let Err(source) = self.event_loop.register(fd, readable, writable, routine, 0) {
            fatal(RuntimeError::ReadinessFacilityMisuse(format!(
                "registering fd {fd} (readable={readable}, writable={writable}) failed: {source}"
            )));
        }
    }
}

/// The engine-facing handle to a scheduler thread: just enough to hand it work and ask
/// it to stop. The actual OS thread owns a `SchedulerThreadInner` on its stack; nothing
/// outside that thread ever reaches into it except through `inbound` and `waker`.
pub struct SchedulerThread {
    pub(crate) id: ThreadId,
    pub(crate) inbound: Arc<WfQueue<Command>>,
    waker: Arc<Waker>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SchedulerThread {
    pub(crate) fn spawn(
        id: ThreadId,
        capacity_hint: usize,
        live_routines: Arc<AtomicUsize>,
    ) -> crate::error::RuntimeResult<Self> {
        let inbound = Arc::new(WfQueue::new(capacity_hint.max(1)));
        let event_loop = EventLoop::new(id.as_usize(), capacity_hint)?;
        let waker = event_loop.waker();

        let inbound_for_thread = Arc::clone(&inbound);
        let join = std::thread::Builder::new()
            .name(format!("boson-rt-{}", id.as_usize()))
            .spawn(move || {
                let mut inner = SchedulerThreadInner::new(id, event_loop, inbound_for_thread, live_routines);
                while inner.run_iteration() {}
            })
            .map_err(|source| crate::error::RuntimeError::ThreadSpawn { thread_index: id.as_usize(), source })?;

        Ok(Self { id, inbound, waker, join: Some(join) })
    }

    pub(crate) fn send(&self, command: Command) {
        self.inbound.push(command);
        let _ = self.waker.wake();
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Tells this thread it may stop. Only meaningful to call once the engine has
    /// confirmed global quiescence (see [`crate::engine::Engine::shutdown`]); otherwise
    /// a thread could drain this before a sibling's round-robin placement lands.
    pub(crate) fn request_shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        self.request_shutdown();
        self.join();
    }
}

/// Called from within a routine's body (via [`with_current`]) to reach the mutable
/// scheduler-thread state needed to attach a select branch or arm a timer.
pub(crate) fn with_inner<R>(f: impl FnOnce(&mut SchedulerThreadInner) -> R) -> R {
    with_current(|ctx| {
        // SAFETY: `ctx.thread` is only ever set by `step_routine` to point at the
        // `SchedulerThreadInner` currently driving this exact OS thread's loop, and is
        // cleared before that stack frame returns; a routine only runs while its home
        // thread's `run_iteration` call is on the stack above it.
        let inner = unsafe { &mut *ctx.thread };
        f(inner)
    })
}
