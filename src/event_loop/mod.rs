//! The per-thread readiness facility wrapper (spec §4.2), grounded on the teacher's
//! `resilient_reactor_thread` module's use of `mio::{Poll, Events, Waker, Token}` and on
//! `linux/event_loop_impl.cc`'s epoll-backed dispatch rules.

mod event_id;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

pub use event_id::{Direction, EventId};

use crate::error::{RuntimeError, RuntimeResult};
use crate::routine::RoutineHandle;

/// One direction's waiter on a registered fd: which routine is waiting and which
/// branch of its current select round this corresponds to.
type Waiter = (RoutineHandle, usize);

/// Both directions' bookkeeping for one registered fd. A fd with only one direction
/// live has the other side `None`; both may be simultaneously populated when two
/// different routines wait on the same fd in opposite directions, which is why this
/// is a struct rather than the single-waiter `EventData` the token scheme used to
/// assume.
#[derive(Default)]
struct FdState {
    read: Option<Waiter>,
    write: Option<Waiter>,
}

/// What a single drained readiness notification means for its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Read,
    Write,
    /// Hangup/error without a matching read-interest: per §4.2, delivered as an
    /// interrupted wake (the waiting call observes `EINTR`-equivalent) rather than
    /// silently treated as read-ready.
    Interrupted,
}

/// Wraps `mio::Poll` plus an fd-indexed table of live registrations. The table is a
/// dense `Vec` indexed directly by raw fd, matching §3's "dense vector indexed by fd"
/// requirement; the fd's value doubles as its `mio::Token` so there is exactly one
/// epoll/kqueue registration per fd regardless of how many directions it carries.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    waker_token: Token,
    fds: Vec<Option<FdState>>,
}

/// Token reserved for the cross-thread wake signal (`Waker`); never reused for an fd.
const WAKER_TOKEN: Token = Token(usize::MAX);

fn interest_for(readable: bool, writable: bool) -> Interest {
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

impl EventLoop {
    pub fn new(thread_index: usize, capacity: usize) -> RuntimeResult<Self> {
        let poll = Poll::new().map_err(|source| RuntimeError::EventLoopInit { thread_index, source })?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|source| RuntimeError::EventLoopInit { thread_index, source })?;
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(64)),
            waker: Arc::new(waker),
            waker_token: WAKER_TOKEN,
            fds: Vec::new(),
        })
    }

    /// Lets a foreign thread interrupt this loop's blocking poll, used when a `Command`
    /// is pushed onto this thread's inbound queue from elsewhere (spec §4.7).
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    fn slot(&mut self, fd: RawFd) -> &mut Option<FdState> {
        let idx = fd as usize;
        if idx >= self.fds.len() {
            self.fds.resize_with(idx + 1, || None);
        }
        &mut self.fds[idx]
    }

    /// Registers interest in `fd` becoming readable *or* writable (exactly one of
    /// `readable`/`writable` is set) for `routine`'s branch `branch_index`, returning
    /// an [`EventId`] the caller stores to match a later readiness event or retract
    /// the registration.
    ///
    /// If `fd` already carries a registration for the other direction (a different
    /// routine waiting on the same fd in the opposite direction), this coalesces into
    /// the existing `epoll_ctl`/`kevent` entry via a re-register with the union of
    /// interest bits, rather than attempting a second add (which the kernel rejects
    /// with `EEXIST` since a single fd can only be added once).
    pub fn register(
        &mut self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        routine: RoutineHandle,
        branch_index: usize,
    ) -> io::Result<EventId> {
        debug_assert!(readable ^ writable, "one registration call always targets exactly one direction");
        let direction = if readable { Direction::Read } else { Direction::Write };
        let slot = self.slot(fd);
        let existed = slot.is_some();
        let state = slot.get_or_insert_with(FdState::default);
        match direction {
            Direction::Read => state.read = Some((routine, branch_index)),
            Direction::Write => state.write = Some((routine, branch_index)),
        }
        let interest = interest_for(state.read.is_some(), state.write.is_some());
        let token = Token(fd as usize);
        if existed {
            self.poll.registry().reregister(&mut SourceFd(&fd), token, interest)?;
        } else {
            self.poll.registry().register(&mut SourceFd(&fd), token, interest)?;
        }
        Ok(EventId { fd, direction })
    }

    /// Retracts the direction `id` represents. If the other direction is still live on
    /// this fd, the underlying registration is narrowed (re-registered) rather than
    /// removed; only once both directions are clear is the fd actually deregistered.
    pub fn unregister(&mut self, id: EventId) -> io::Result<()> {
        let idx = id.fd as usize;
        let Some(state) = self.fds.get_mut(idx).and_then(Option::as_mut) else {
            return Ok(());
        };
        match id.direction {
            Direction::Read => state.read = None,
            Direction::Write => state.write = None,
        }
        if state.read.is_none() && state.write.is_none() {
            self.fds[idx] = None;
            self.poll.registry().deregister(&mut SourceFd(&id.fd))
        } else {
            let interest = interest_for(state.read.is_some(), state.write.is_some());
            self.poll.registry().reregister(&mut SourceFd(&id.fd), Token(idx), interest)
        }
    }

    #[must_use]
    pub fn registration(&self, id: EventId) -> Option<Waiter> {
        let state = self.fds.get(id.fd as usize)?.as_ref()?;
        match id.direction {
            Direction::Read => state.read.clone(),
            Direction::Write => state.write.clone(),
        }
    }

    /// Blocks (up to `timeout`, or indefinitely if `None`) for readiness events or a
    /// cross-thread wake, returning each ready direction's [`EventId`] and
    /// [`Readiness`]. A fd with both directions registered can yield up to two entries
    /// from the same underlying event (e.g. a socket that is simultaneously readable
    /// and writable wakes both its reader and its writer). The cross-thread waker's
    /// own event is swallowed here: its only job is unblocking `poll`, the caller
    /// always re-drains its inbound command queue on every iteration regardless of why
    /// `poll` returned.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(EventId, Readiness)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }
        let mut fired = Vec::new();
        for event in self.events.iter() {
            if event.token() == self.waker_token {
                continue;
            }
            let idx = event.token().0;
            let fd = idx as RawFd;
            let Some(state) = self.fds.get(idx).and_then(Option::as_ref) else { continue };
            let has_read = state.read.is_some();
            let has_write = state.write.is_some();
            let hangup_or_error = event.is_error() || event.is_read_closed();
            let readable = event.is_readable() && has_read;
            // §4.2: error/hangup without a matching read interest delivers as
            // interrupted, to whichever direction(s) are actually subscribed, rather
            // than being folded silently into read-readiness.
            if hangup_or_error && !readable {
                if has_read {
                    fired.push((EventId { fd, direction: Direction::Read }, Readiness::Interrupted));
                }
                if has_write {
                    fired.push((EventId { fd, direction: Direction::Write }, Readiness::Interrupted));
                }
                continue;
            }
            if event.is_writable() && has_write {
                fired.push((EventId { fd, direction: Direction::Write }, Readiness::Write));
            }
            if readable {
                fired.push((EventId { fd, direction: Direction::Read }, Readiness::Read));
            }
        }
        Ok(fired)
    }

    /// Every direction currently registered on `fd`, for bulk operations like
    /// [`crate::engine::Engine::fd_panic`] that need to wake every subscriber on a
    /// given fd regardless of direction.
    pub(crate) fn registrations_on(&self, fd: RawFd) -> Vec<EventId> {
        let Some(Some(state)) = self.fds.get(fd as usize) else { return Vec::new() };
        let mut ids = Vec::with_capacity(2);
        if state.read.is_some() {
            ids.push(EventId { fd, direction: Direction::Read });
        }
        if state.write.is_some() {
            ids.push(EventId { fd, direction: Direction::Write });
        }
        ids
    }
}
