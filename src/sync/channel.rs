//! Bounded typed channel (spec §3, §4.6): a ring buffer guarded by two semaphores whose
//! signed counters double as waiter counts, matching `Channel<T, N>`'s description in
//! the data model.

use std::ops::{Shl, Shr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ring_buffer::RingBuffer;
use super::semaphore::Semaphore;
use crate::engine::ThreadRouters;

struct ChannelInner<T> {
    buffer: RingBuffer<T>,
    /// Counts filled slots; routines recv-ing wait on this.
    items: Semaphore,
    /// Counts empty slots; routines send-ing wait on this.
    space: Semaphore,
    closed: AtomicBool,
}

/// A bounded MPMC channel of capacity `N`. Cloning a `Channel` yields another handle to
/// the same underlying buffer, not an independent channel — every clone observes the
/// same items, the same `close()`, matching `Semaphore`'s and `Mutex`'s reference
/// semantics in this crate.
pub struct Channel<T, const N: usize>(Arc<ChannelInner<T>>);

impl<T, const N: usize> Clone for Channel<T, N> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Returned by [`Channel::send`] when the channel was closed before or during the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl<T, const N: usize> Channel<T, N> {
    pub(crate) fn new(routers: ThreadRouters) -> Self {
        assert!(N > 0, "a channel must have a positive capacity");
        Self(Arc::new(ChannelInner {
            buffer: RingBuffer::new(N),
            items: Semaphore::new(0, routers.clone()),
            space: Semaphore::new(N as isize, routers),
            closed: AtomicBool::new(false),
        }))
    }

    /// Sends `value`, suspending the calling routine while the channel is full.
    ///
    /// # Errors
    /// Returns [`ChannelClosed`] without enqueuing `value` if the channel had already
    /// been closed.
    ///
    /// # Panics
    /// Panics if called from outside a running routine.
    pub fn send(&self, value: T) -> Result<(), ChannelClosed> {
        self.0.space.wait();
        if self.0.closed.load(Ordering::Acquire) {
            self.0.space.post();
            return Err(ChannelClosed);
        }
        self.0.buffer.push(value);
        self.0.items.post();
        Ok(())
    }

    /// Receives the oldest value, suspending the calling routine while the channel is
    /// empty. Returns `None` once the channel is closed and drained.
    ///
    /// # Panics
    /// Panics if called from outside a running routine.
    pub fn recv(&self) -> Option<T> {
        self.0.items.wait();
        if self.0.buffer.len() == 0 {
            // Woken only because `close()` posted a permit for every blocked
            // receiver; nothing was actually enqueued.
            self.0.items.post();
            return None;
        }
        let value = self.0.buffer.pop();
        self.0.space.post();
        Some(value)
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        if !self.0.items.try_wait() {
            return None;
        }
        if self.0.buffer.len() == 0 {
            self.0.items.post();
            return None;
        }
        let value = self.0.buffer.pop();
        self.0.space.post();
        Some(value)
    }

    /// Closes the channel: every `send` after this point fails, and every routine
    /// currently (or later) blocked in `send` or `recv` wakes rather than hanging
    /// forever — a blocked sender sees `ChannelClosed` instead of enqueuing, a blocked
    /// receiver sees `None` instead of waiting on a send that will never come.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes every routine currently blocked on either side, not just N of them —
        // the number of waiters on a semaphore isn't bounded by the channel's capacity.
        // A waiter that wakes on one of these checks `closed` before touching the
        // buffer (see `send`/`recv`/`SendBranch`/`RecvBranch`) and reposts rather than
        // using it, so the phantom permit cascades to the next blocked waiter instead
        // of actually growing the channel's capacity.
        self.0.items.wake_all();
        self.0.space.wake_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    pub(crate) fn items_semaphore(&self) -> &Semaphore {
        &self.0.items
    }

    pub(crate) fn space_semaphore(&self) -> &Semaphore {
        &self.0.space
    }

    pub(crate) fn pop_locked(&self) -> T {
        self.0.buffer.pop()
    }

    pub(crate) fn push_locked(&self, value: T) {
        self.0.buffer.push(value);
    }

    pub(crate) fn is_closed_flag(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

/// `c << v` is sugar for [`Channel::send`].
impl<T, const N: usize> Shl<T> for &Channel<T, N> {
    type Output = Result<(), ChannelClosed>;

    fn shl(self, value: T) -> Self::Output {
        self.send(value)
    }
}

/// `c >> &mut slot` is sugar for [`Channel::recv`], storing the result (`None` once
/// closed and drained) into `slot` rather than returning it, mirroring the original
/// source's `channel >> out_param` convention.
impl<T, const N: usize> Shr<&mut Option<T>> for &Channel<T, N> {
    type Output = ();

    fn shr(self, slot: &mut Option<T>) {
        *slot = self.recv();
    }
}
