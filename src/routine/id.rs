//! Routine identity.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing, engine-global routine identifier.
///
/// Newtyped rather than a bare `u64`, matching the teacher's habit of wrapping small
/// copyable identifiers (`Index`, `Length`) instead of passing primitives around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutineId(u64);

impl RoutineId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RoutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "routine#{}", self.0)
    }
}

/// Engine-wide generator for [`RoutineId`]s. Lock-free: a single `fetch_add` per id.
#[derive(Debug, Default)]
pub struct RoutineIdGenerator {
    next: AtomicU64,
}

impl RoutineIdGenerator {
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(0) }
    }

    pub fn next_id(&self) -> RoutineId {
        RoutineId::from_raw(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A scheduler thread's stable index within the engine's thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u32);

impl ThreadId {
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}
