//! Fixed-capacity heap-backed storage for [`super::Channel`].
//!
//! The channel's two semaphores already guarantee a `push` never runs against a full
//! buffer and a `pop` never runs against an empty one, so this is deliberately just a
//! `Mutex<VecDeque<T>>` rather than a bespoke lock-free ring: the critical section is a
//! single push/pop, and by construction is never contended enough to matter.

use std::collections::VecDeque;
use std::sync::Mutex;

pub(super) struct RingBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> RingBuffer<T> {
    pub(super) fn new(capacity: usize) -> Self {
        Self { capacity, items: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub(super) fn push(&self, value: T) {
        let mut items = self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert!(items.len() < self.capacity, "push into a full ring buffer");
        items.push_back(value);
    }

    pub(super) fn pop(&self) -> T {
        let mut items = self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        items.pop_front().expect("pop from an empty ring buffer")
    }

    pub(super) fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}
