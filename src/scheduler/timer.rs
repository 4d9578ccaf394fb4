//! Per-thread timer map: the `deadline` branch kind of `select_any`, plus plain
//! `sleep()`. Ordered by deadline so the scheduler thread's poll timeout is always just
//! "time until the next entry" (spec §4.3, §4.4).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::routine::RoutineHandle;

/// A point in time a routine is waiting to reach. Wraps `Instant` rather than exposing
/// it directly so callers go through `Deadline::after`/`now` instead of reaching for
/// wall-clock time, which would break under a paused/mocked clock in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    #[must_use]
    pub fn after(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    #[must_use]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    #[must_use]
    pub fn has_passed(self) -> bool {
        self.0 <= Instant::now()
    }

    #[must_use]
    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

/// Opaque key for cancelling a registered timer before it fires (a `select_any` branch
/// retracted because a sibling branch won).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId(Deadline, u64);

pub struct TimerEntry {
    pub routine: RoutineHandle,
    pub branch_index: usize,
}

/// Ordered multimap from deadline to waiting routines. A `BTreeMap` keyed on
/// `(Deadline, sequence)` rather than a binary heap: cancellation needs point removal
/// by key, which a heap does not support without a parallel tombstone table.
#[derive(Default)]
pub struct TimerMap {
    entries: BTreeMap<TimerId, TimerEntry>,
    next_seq: u64,
}

impl TimerMap {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), next_seq: 0 }
    }

    pub fn register(&mut self, deadline: Deadline, routine: RoutineHandle, branch_index: usize) -> TimerId {
        let id = TimerId(deadline, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(id, TimerEntry { routine, branch_index });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<TimerEntry> {
        self.entries.remove(&id)
    }

    /// Removes and returns every entry whose deadline has passed, earliest first.
    pub fn pop_due(&mut self) -> Vec<(TimerId, TimerEntry)> {
        let now = Deadline::now();
        let split_key = TimerId(now, u64::MAX);
        let due_keys: Vec<TimerId> = self.entries.range(..=split_key).map(|(k, _)| *k).collect();
        due_keys
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// How long the scheduler thread may block its readiness poll before the next
    /// timer needs to fire, or `None` if there are no pending timers.
    #[must_use]
    pub fn next_timeout(&self) -> Option<std::time::Duration> {
        self.entries.keys().next().map(|id| id.0.remaining())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::{Routine, RoutineIdGenerator, ThreadId};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn dummy_routine() -> RoutineHandle {
        let gen = RoutineIdGenerator::new();
        Rc::new(RefCell::new(Routine::new(gen.next_id(), ThreadId(0), || {})))
    }

    #[test]
    fn pop_due_returns_entries_in_deadline_order() {
        let mut map = TimerMap::new();
        let far = map.register(Deadline::after(Duration::from_secs(10)), dummy_routine(), 0);
        let _near = map.register(Deadline::now(), dummy_routine(), 0);
        std::thread::sleep(Duration::from_millis(5));
        let due = map.pop_due();
        assert_eq!(due.len(), 1);
        assert!(map.cancel(far).is_some());
    }

    #[test]
    fn cancel_removes_without_firing() {
        let mut map = TimerMap::new();
        let id = map.register(Deadline::now(), dummy_routine(), 0);
        assert!(map.cancel(id).is_some());
        assert!(map.pop_due().is_empty());
    }
}
