//! A wait-free, bounded-patience MPMC queue, grounded on `wfqueue.h`'s segmented-array
//! design. Used for exactly one purpose in this crate: carrying
//! [`crate::scheduler::command::Command`] values from any thread into a scheduler
//! thread's inbound queue (spec §4.1, §4.7) — a foreign thread never touches a
//! `Routine` directly, it pushes a command here and the owning thread drains it on its
//! next loop iteration.
//!
//! Layout: an unbounded chain of fixed-size segments (`Node`s of `NODE_SIZE` cells)
//! addressed by two monotonically increasing global indices, `Ei` (next enqueue slot)
//! and `Di` (next dequeue slot). A producer claims a slot with `fetch_add` on `Ei`, then
//! writes its value into that slot's cell with a single CAS; a consumer claims a slot
//! the same way against `Di` and spins, bounded by `MAX_PATIENCE`, for the matching
//! producer to finish its CAS. Segments are appended lazily as `Ei`/`Di` run past the
//! end of the chain and retired (freed) once fully drained, using hazard pointers so a
//! thread mid-traversal of a segment is never left holding a dangling reference.
//!
//! Unlike the original's strict wait-freedom, a dequeuer that outruns the matching
//! enqueuer's CAS by more than `MAX_PATIENCE` spins closes the cell and retries at a
//! fresh index rather than helping the stalled producer directly — simpler, and in
//! practice the producers here (`push` from arbitrary threads) never block between
//! their `fetch_add` and their CAS, so the window is a handful of instructions.

mod hazard;
mod node;

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use hazard::{HazardRegistry, RetireList};
use node::{Cell, Node, CLOSED, EMPTY, MAX_PATIENCE, NODE_SIZE};

/// A multi-producer, multi-consumer queue of pointer-sized items.
///
/// `T` is boxed internally (`Box::into_raw`/`Box::from_raw`) so a cell's payload is
/// always exactly one pointer wide regardless of `T`'s own size, matching the wire
/// shape the original passes through `void*` queues.
pub struct WfQueue<T> {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    ei: AtomicU64,
    di: AtomicU64,
    registry: HazardRegistry,
    retire: RetireList,
    thread_count: usize,
    _marker: std::marker::PhantomData<T>,
}

// SAFETY: all interior mutability here is through atomics and the `Mutex` inside
// `RetireList`; `T` crosses threads boxed exactly like any `Arc<Mutex<T>>` payload
// would, so the usual `T: Send` bound suffices.
unsafe impl<T: Send> Send for WfQueue<T> {}
unsafe impl<T: Send> Sync for WfQueue<T> {}

impl<T> WfQueue<T> {
    /// Creates an empty queue sized for up to `thread_count` concurrent hazard-pointer
    /// users (the engine's scheduler thread count plus however many foreign threads
    /// push into it); exceeding it is safe, just means hazard slots are shared.
    #[must_use]
    pub fn new(thread_count: usize) -> Self {
        let sentinel = Box::into_raw(Node::new(0));
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            ei: AtomicU64::new(0),
            di: AtomicU64::new(0),
            registry: HazardRegistry::new(thread_count.max(1)),
            retire: RetireList::new(),
            thread_count: thread_count.max(1),
            _marker: std::marker::PhantomData,
        }
    }

    /// Enqueues `value`. Lock-free and non-blocking: at most a bounded number of CAS
    /// retries against a concurrent dequeuer that closed the same slot.
    pub fn push(&self, value: T) {
        let raw = Box::into_raw(Box::new(value)) as usize;
        debug_assert!(raw > CLOSED, "boxed value address collided with a reserved sentinel");
        loop {
            let index = self.ei.fetch_add(1, Ordering::Relaxed);
            let (node, offset) = self.find_cell(&self.tail, index);
            let cell = cell_at(node, offset);
            let result = cell.val.compare_exchange(EMPTY, raw, Ordering::AcqRel, Ordering::Acquire);
            self.registry.clear();
            if result.is_ok() {
                cell.id.store(index, Ordering::Release);
                return;
            }
            // A dequeuer gave up on this slot first (`CLOSED`); claim a fresh index.
        }
    }

    /// Removes and returns the oldest value, or `None` if the queue currently has no
    /// committed producer ahead of the consumer side. Never blocks.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let d = self.di.load(Ordering::Acquire);
            let e = self.ei.load(Ordering::Acquire);
            if d >= e {
                return None;
            }
            let index = self.di.fetch_add(1, Ordering::Relaxed);
            let (node, offset) = self.find_cell(&self.head, index);
            let cell = cell_at(node, offset);

            let mut val = cell.val.load(Ordering::Acquire);
            let mut patience = 0;
            while val == EMPTY && patience < MAX_PATIENCE {
                std::hint::spin_loop();
                val = cell.val.load(Ordering::Acquire);
                patience += 1;
            }
            if val == EMPTY {
                match cell.val.compare_exchange(EMPTY, CLOSED, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        self.registry.clear();
                        continue;
                    }
                    Err(actual) => val = actual,
                }
            }
            if val == CLOSED {
                self.registry.clear();
                continue;
            }

            self.maybe_retire_node(node, offset);
            self.registry.clear();
            // SAFETY: `val` was written by exactly one `push` via `Box::into_raw` and
            // is read out by exactly one `try_pop` (the CAS above is the sole
            // serialization point for this slot), so this is the unique owner.
            let boxed = unsafe { Box::from_raw(val as *mut T) };
            return Some(*boxed);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.di.load(Ordering::Acquire) >= self.ei.load(Ordering::Acquire)
    }

    /// Walks `anchor`'s segment chain from its current node to the segment containing
    /// `index`, extending the chain with freshly allocated segments as needed. Returns
    /// the segment and the cell offset within it. Publishes a hazard pointer for the
    /// node it returns; the caller must call `self.registry.clear()` once done with it.
    fn find_cell(&self, anchor: &AtomicPtr<Node>, index: u64) -> (*mut Node, usize) {
        let target_id = index / NODE_SIZE as u64;
        let mut node = anchor.load(Ordering::Acquire);
        loop {
            self.registry.publish(node);
            // Re-validate: the anchor may have been retired and replaced between our
            // plain load and the hazard publish above.
            let revalidated = anchor.load(Ordering::Acquire);
            if revalidated != node {
                node = revalidated;
                continue;
            }
            // SAFETY: published as a hazard above, and a node is only freed once no
            // hazard slot names it (`RetireList::retire`).
            let node_ref = unsafe { &*node };
            if node_ref.id == target_id {
                return (node, (index % NODE_SIZE as u64) as usize);
            }
            let mut next = node_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                let new_node = Box::into_raw(Node::new(node_ref.id + 1));
                match node_ref.next.compare_exchange(
                    std::ptr::null_mut(),
                    new_node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(()) => next = new_node,
                    Err(actual) => {
                        // SAFETY: never published, never linked into any chain.
                        unsafe { drop(Box::from_raw(new_node)) };
                        next = actual;
                    }
                }
            }
            let _ = anchor.compare_exchange(node, next, Ordering::AcqRel, Ordering::Acquire);
            node = next;
        }
    }

    /// Once a segment is fully drained, unlinks it from `head` and hands it to the
    /// retire list rather than freeing it immediately, so a concurrent hazard-pointer
    /// holder finishing a traversal never dereferences freed memory.
    fn maybe_retire_node(&self, node: *mut Node, offset: usize) {
        if offset != NODE_SIZE - 1 {
            return;
        }
        // SAFETY: published as a hazard by the caller (`try_pop`), still valid here.
        let node_ref = unsafe { &*node };
        let next = node_ref.next.load(Ordering::Acquire);
        if next.is_null() {
            return;
        }
        if self.head.compare_exchange(node, next, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            // SAFETY: just unlinked from `head`; no future `find_cell` call can reach
            // it through the chain again, so it is eligible for reclamation once no
            // hazard slot still names it.
            unsafe { self.retire.retire(node, &self.registry, self.thread_count) };
        }
    }
}

fn cell_at(node: *mut Node, offset: usize) -> &'static Cell {
    // SAFETY: caller holds a live hazard publication for `node` for the duration of
    // this reference's use.
    &unsafe { &*node }.cells[offset]
}

impl<T> Drop for WfQueue<T> {
    fn drop(&mut self) {
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            // SAFETY: `&mut self` proves no other thread holds a reference into this
            // queue anymore, so the entire chain is safe to walk and free.
            let node = unsafe { Box::from_raw(current) };
            for cell in node.cells.iter() {
                let val = cell.val.load(Ordering::Relaxed);
                if val != EMPTY && val != CLOSED {
                    // SAFETY: every non-sentinel value was produced by exactly one
                    // `Box::into_raw` in `push` and never freed on the pop path unless
                    // also removed from the chain here (mutually exclusive).
                    unsafe { drop(Box::from_raw(val as *mut T)) };
                }
            }
            current = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_fifo_order() {
        let q: WfQueue<u32> = WfQueue::new(1);
        for i in 0..10 {
            q.push(i);
        }
        for i in 0..10 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn empty_queue_returns_none() {
        let q: WfQueue<u32> = WfQueue::new(1);
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn spans_multiple_segments() {
        let q: WfQueue<u64> = WfQueue::new(1);
        let total = NODE_SIZE * 3 + 7;
        for i in 0..total as u64 {
            q.push(i);
        }
        let mut seen = Vec::with_capacity(total);
        while let Some(v) = q.try_pop() {
            seen.push(v);
        }
        assert_eq!(seen.len(), total);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "FIFO order violated");
    }

    #[test]
    fn concurrent_producers_single_consumer_preserve_all_items() {
        let q = Arc::new(WfQueue::<u64>::new(5));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..2000u64 {
                        q.push(t * 10_000 + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut count = 0;
        while q.try_pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 4 * 2000);
    }

    #[test]
    fn drop_with_pending_items_does_not_leak_or_crash() {
        let q: WfQueue<String> = WfQueue::new(1);
        q.push("a".to_string());
        q.push("b".to_string());
        drop(q);
    }
}
