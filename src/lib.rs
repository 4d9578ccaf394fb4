//! A user-space cooperative concurrency runtime: lightweight **routines** (green
//! threads) multiplexed over a fixed pool of OS threads, each driving its own
//! epoll/kqueue-backed event loop via `mio`. Provides bounded typed channels,
//! semaphores, mutexes, non-blocking POSIX-style I/O wrappers, and a composable
//! [`select_any!`] that waits on the first of several heterogeneous events.
//!
//! # Shape
//!
//! An [`Engine`] owns `n` scheduler threads. [`Engine::spawn`] starts a routine on one
//! of them (round-robin by default, or [`Engine::spawn_on`] for a specific thread).
//! Every [`sync::Semaphore`]/[`sync::Mutex`]/[`sync::Channel`] the engine constructs is
//! a cheap, `Clone`-able handle shared across every routine and every thread; the
//! underlying wake-up always lands back on the exact OS thread that owns the waiting
//! routine, never migrating it.
//!
//! # Example
//!
//! ```no_run
//! use boson_rt::{io, Engine, EngineConfig};
//!
//! Engine::run(EngineConfig::default(), || {
//!     io::sleep(std::time::Duration::from_millis(1));
//!     println!("routine finished");
//! })
//! .unwrap();
//! ```
//!
//! # Non-goals
//!
//! Preemptive scheduling, cross-thread work-stealing of ready routines, strict FIFO
//! fairness across threads, persistence, cryptography.

mod engine;
mod error;
mod event_loop;
pub mod io;
/// Not part of the stable API; exposed only so `benches/mpmc_queue.rs` can drive the
/// wait-free queue directly without going through a full engine.
#[doc(hidden)]
pub mod queue;
mod routine;
mod scheduler;
pub mod select;
mod sync;

pub use engine::{Engine, EngineConfig};
pub use error::{Errno, RuntimeError, RuntimeResult, EBADF_SENTINEL, EINTR_SENTINEL, ETIMEDOUT_SENTINEL};
pub use io::{sleep, yield_now};
pub use routine::{RoutineId, ThreadId};
pub use scheduler::timer::Deadline;
pub use sync::{Channel, ChannelClosed, Mutex, MutexGuard, Semaphore};

// `select_any!` is exported at the crate root automatically via `#[macro_export]` in
// the `select` module; manual branch construction (`select::ReadBranch` and friends)
// stays reachable through `boson_rt::select` for callers composing their own rounds.
