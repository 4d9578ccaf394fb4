//! Hazard-pointer node reclamation for [`super::WfQueue`].
//!
//! A thread walking the segment list to find its cell publishes the node it is
//! currently touching into a slot in a shared registry before dereferencing it. A
//! thread that has unlinked a node (advanced the queue head past it) only frees that
//! node once no registry slot still names it. Reclamation is deferred and batched: a
//! thread accumulates unlinked nodes in a private retire list and only scans the
//! registry once that list crosses `MAX_GARBAGE(threads) = 2 * threads`, matching the
//! original's amortized collection scheme rather than scanning on every unlink.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::node::Node;

const NO_HAZARD: *mut Node = std::ptr::null_mut();

thread_local! {
    /// Maps a registry's address to the slot this thread was lazily assigned within
    /// it, so one thread can safely use several independent queues.
    static THREAD_SLOTS: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

pub(super) struct HazardRegistry {
    slots: Vec<AtomicPtr<Node>>,
    registered: AtomicUsize,
}

impl HazardRegistry {
    pub(super) fn new(max_threads: usize) -> Self {
        Self {
            slots: (0..max_threads.max(1)).map(|_| AtomicPtr::new(NO_HAZARD)).collect(),
            registered: AtomicUsize::new(0),
        }
    }

    fn slot_for_current_thread(&self) -> usize {
        let key = std::ptr::from_ref(self) as usize;
        THREAD_SLOTS.with(|slots| {
            *slots
                .borrow_mut()
                .entry(key)
                .or_insert_with(|| self.registered.fetch_add(1, Ordering::Relaxed) % self.slots.len())
        })
    }

    pub(super) fn publish(&self, node: *mut Node) {
        let idx = self.slot_for_current_thread();
        self.slots[idx].store(node, Ordering::Release);
    }

    pub(super) fn clear(&self) {
        let idx = self.slot_for_current_thread();
        self.slots[idx].store(NO_HAZARD, Ordering::Release);
    }

    fn is_hazardous(&self, node: *mut Node) -> bool {
        self.slots.iter().any(|slot| slot.load(Ordering::Acquire) == node)
    }
}

/// Per-thread retire list, flushed against the registry once it grows past the
/// garbage threshold (`MAX_GARBAGE(n) = 2n`).
pub(super) struct RetireList {
    pending: Mutex<Vec<*mut Node>>,
}

// SAFETY: `*mut Node` values are only ever dereferenced after confirming (under the
// registry scan) that no thread holds them hazardous; the Mutex gives the list itself
// safe concurrent access.
unsafe impl Send for RetireList {}
unsafe impl Sync for RetireList {}

impl RetireList {
    pub(super) fn new() -> Self {
        Self { pending: Mutex::new(Vec::new()) }
    }

    /// Queues `node` for reclamation and, once the garbage threshold is crossed, frees
    /// every queued node the registry no longer marks as hazardous.
    ///
    /// # Safety
    /// `node` must already be unlinked from the live segment chain (unreachable via a
    /// fresh traversal from the queue's head/tail) and must not be retired twice.
    pub(super) unsafe fn retire(&self, node: *mut Node, registry: &HazardRegistry, thread_count: usize) {
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.push(node);
        let threshold = (2 * thread_count).max(2);
        if pending.len() < threshold {
            return;
        }
        let mut remaining = Vec::with_capacity(pending.len());
        for candidate in pending.drain(..) {
            if registry.is_hazardous(candidate) {
                remaining.push(candidate);
            } else {
                // SAFETY: caller's contract plus the hazard scan above establish this
                // pointer is both uniquely owned and unobserved by any other thread.
                unsafe { drop(Box::from_raw(candidate)) };
            }
        }
        *pending = remaining;
    }
}
