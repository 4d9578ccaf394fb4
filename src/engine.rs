//! The engine: owns the scheduler thread pool and the round-robin placement policy
//! (spec §2, §4.7), grounded on `internal/thread.cc`'s `engine_proxy` plus the
//! teacher's pattern of a config struct driving a fixed worker-thread pool.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::Waker;
use tracing::info;

use crate::error::{RuntimeError, RuntimeResult};
use crate::queue::WfQueue;
use crate::routine::{Routine, RoutineId, RoutineIdGenerator, ThreadId};
use crate::scheduler::command::Command;
use crate::scheduler::SchedulerThread;
use crate::sync::{Channel, Mutex, Semaphore};

/// Configuration for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of scheduler OS threads. Defaults to the host's available parallelism.
    pub thread_count: usize,
    /// Initial capacity hint for each thread's readiness-event buffer and inbound
    /// command queue.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let thread_count = std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1);
        Self { thread_count, event_capacity: 256 }
    }
}

/// One scheduler thread's mailbox, as seen from outside that thread: enough to push a
/// [`Command`] and wake its blocked readiness poll. Cheaply cloned and hand out to
/// every sync primitive constructed through the engine, so `Semaphore::post` can route
/// a wake to any routine's home thread without reaching into `SchedulerThread` itself
/// (which also owns the non-`Clone` `JoinHandle`).
#[derive(Clone)]
pub(crate) struct ThreadRouter {
    inbound: Arc<WfQueue<Command>>,
    waker: Arc<Waker>,
}

impl ThreadRouter {
    fn send(&self, command: Command) {
        self.inbound.push(command);
        let _ = self.waker.wake();
    }
}

/// The full thread table, shared (by `Arc`) into every sync primitive the engine
/// constructs.
#[derive(Clone)]
pub struct ThreadRouters(Arc<Vec<ThreadRouter>>);

impl ThreadRouters {
    pub(crate) fn send(&self, thread: ThreadId, command: Command) {
        self.0[thread.as_usize()].send(command);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    fn broadcast(&self, command: impl Fn() -> Command) {
        for router in self.0.iter() {
            router.send(command());
        }
    }
}

/// Owns a fixed pool of scheduler threads and the identifier generator shared across
/// them. The unit of composition a program builds its routines, channels, semaphores
/// and mutexes through.
pub struct Engine {
    threads: Vec<SchedulerThread>,
    routers: ThreadRouters,
    id_gen: RoutineIdGenerator,
    next_placement: std::sync::atomic::AtomicUsize,
    /// Count of routines spawned anywhere in this engine that have not yet finished.
    /// Incremented in `spawn`/`spawn_on` before the `Command::AddRoutine` that makes the
    /// routine visible to its home thread, decremented by that thread once the routine
    /// steps to completion. `shutdown` waits for this to reach zero before telling any
    /// thread to stop, which is what rules out a thread exiting while a sibling is still
    /// mid-placement of a new routine onto it.
    live_routines: Arc<AtomicUsize>,
}

impl Engine {
    /// Spawns `config.thread_count` scheduler threads, each with its own readiness
    /// facility and ready queue.
    ///
    /// # Errors
    /// Returns [`RuntimeError::NoThreads`] if `config.thread_count` is zero, or
    /// propagates the first [`RuntimeError::ThreadSpawn`]/[`RuntimeError::EventLoopInit`]
    /// failure encountered while bringing a thread up.
    pub fn new(config: EngineConfig) -> RuntimeResult<Self> {
        if config.thread_count == 0 {
            return Err(RuntimeError::NoThreads);
        }
        let live_routines = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::with_capacity(config.thread_count);
        for index in 0..config.thread_count {
            threads.push(SchedulerThread::spawn(ThreadId(index as u32), config.event_capacity, Arc::clone(&live_routines))?);
        }
        let routers = ThreadRouters(Arc::new(
            threads.iter().map(|t| ThreadRouter { inbound: Arc::clone(&t.inbound), waker: t.waker() }).collect(),
        ));
        info!(threads = config.thread_count, "engine started");
        Ok(Self {
            threads,
            routers,
            id_gen: RoutineIdGenerator::new(),
            next_placement: std::sync::atomic::AtomicUsize::new(0),
            live_routines,
        })
    }

    /// Starts `task` on the least-recently-used thread in round-robin order.
    pub fn spawn<F>(&self, task: F) -> RoutineId
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.next_placement.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.threads.len();
        self.spawn_on(ThreadId(index as u32), task)
    }

    /// Starts `task` pinned to a specific scheduler thread.
    ///
    /// # Panics
    /// Panics if `thread` is out of range for this engine's thread pool.
    pub fn spawn_on<F>(&self, thread: ThreadId, task: F) -> RoutineId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.id_gen.next_id();
        let routine = Routine::new(id, thread, task);
        let handle = std::rc::Rc::new(std::cell::RefCell::new(routine));
        // Counted before the command is even pushed, so a concurrent `shutdown` can
        // never observe quiescence while this placement is still in flight.
        self.live_routines.fetch_add(1, Ordering::SeqCst);
        self.routers.send(thread, Command::AddRoutine(handle));
        id
    }

    /// Constructs a semaphore whose waiters can be routed back from any scheduler
    /// thread in this engine.
    #[must_use]
    pub fn semaphore(&self, initial: isize) -> Semaphore {
        Semaphore::new(initial, self.routers.clone())
    }

    #[must_use]
    pub fn mutex<T>(&self, value: T) -> Mutex<T> {
        Mutex::new(value, self.semaphore(1))
    }

    #[must_use]
    pub fn channel<T, const N: usize>(&self) -> Channel<T, N> {
        Channel::new(self.routers.clone())
    }

    /// Forces every registration on `fd` across every thread to wake as interrupted —
    /// used when the caller is about to invalidate an fd (e.g. closing it from outside
    /// the runtime) and wants in-flight waiters released instead of left hanging.
    pub fn fd_panic(&self, fd: RawFd) {
        self.routers.broadcast(|| Command::FdPanic { fd });
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Blocks until no routine spawned anywhere in this engine is still live. Called
    /// before broadcasting shutdown so that a thread which has drained its own ready
    /// queue never gets told to stop while a sibling thread might still round-robin a
    /// new routine onto it.
    fn await_quiescence(&self) {
        while self.live_routines.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }

    /// Waits for every routine spawned anywhere in this engine to finish, then tells
    /// every scheduler thread to stop and blocks until all of them have exited.
    pub fn shutdown(&mut self) {
        self.await_quiescence();
        for thread in &self.threads {
            thread.request_shutdown();
        }
        for thread in &mut self.threads {
            thread.join();
        }
    }

    /// Convenience entry point: brings up an engine, starts `task` as its one root
    /// routine, and blocks the calling thread until every routine the program spawned
    /// (directly or transitively) has finished.
    ///
    /// # Errors
    /// See [`Engine::new`].
    pub fn run<F>(config: EngineConfig, task: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut engine = Self::new(config)?;
        engine.spawn(task);
        engine.shutdown();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.await_quiescence();
        for thread in &self.threads {
            thread.request_shutdown();
        }
    }
}
