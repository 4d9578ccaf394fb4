//! Synchronization primitives built on the semaphore (spec §3, §4.6).

mod channel;
mod mutex;
mod ring_buffer;
mod semaphore;

pub use channel::{Channel, ChannelClosed};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub(crate) use semaphore::{AcquireAttempt, PendingAcquire};
