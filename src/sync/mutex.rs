//! Mutual exclusion as a capacity-1 semaphore (spec §3: "Mutex = Semaphore with
//! capacity 1"), with an RAII guard layered on top for idiomatic Rust usage.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::semaphore::Semaphore;

struct MutexInner<T> {
    semaphore: Semaphore,
    value: UnsafeCell<T>,
}

// SAFETY: `Semaphore::wait`/`post` provide the mutual exclusion; `MutexGuard` is the
// only way to reach `value`, and exactly one guard can exist at a time per the
// semaphore's capacity of one permit.
unsafe impl<T: Send> Send for MutexInner<T> {}
unsafe impl<T: Send> Sync for MutexInner<T> {}

/// A mutex built directly on [`Semaphore`], reference-counted like every other sync
/// handle in this crate.
pub struct Mutex<T>(Arc<MutexInner<T>>);

impl<T> Clone for Mutex<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T, semaphore: Semaphore) -> Self {
        debug_assert_eq!(semaphore.available_permits(), 1);
        Self(Arc::new(MutexInner { semaphore, value: UnsafeCell::new(value) }))
    }

    /// Locks the mutex, suspending the calling routine if it is currently held.
    ///
    /// # Panics
    /// Panics if called from outside a running routine.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.semaphore.wait();
        MutexGuard { mutex: self }
    }

    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.0.semaphore.try_wait().then_some(MutexGuard { mutex: self })
    }

    pub(crate) fn semaphore(&self) -> &Semaphore {
        &self.0.semaphore
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn new(mutex: &'a Mutex<T>) -> Self {
        Self { mutex }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a `MutexGuard` proves the one permit is held by us.
        unsafe { &*self.mutex.0.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`; `&mut self` additionally proves no other live borrow.
        unsafe { &mut *self.mutex.0.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.0.semaphore.post();
    }
}
