//! Composable two-phase `select_any` over heterogeneous wait sources (spec §3, §4.6),
//! grounded on `select.h`'s `subscribe()`/`execute()` pair: `subscribe` attempts the
//! operation immediately and only falls back to registering a wait structure when
//! nothing is ready yet; on resume, exactly one branch's registration fired (the
//! `happened_index` the routine was resumed with) and every other branch is retracted.
//!
//! A branch never performs its operation twice: `subscribe` either discovers the
//! operation can complete right now (in which case this branch is the winner and
//! `finish` is called immediately after) or parks it; for a branch that only becomes
//! ready later, `finish` is the one place the actual read/write/pop/push happens, and
//! it is only ever called on the branch that won.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;

use crate::error::{fatal, RuntimeError};
use crate::event_loop::EventId;
use crate::routine::{suspend_current, RoutineHandle, Suspend};
use crate::scheduler::timer::{Deadline, TimerId};
use crate::scheduler::with_inner;
use crate::sync::{AcquireAttempt, Channel, Mutex, MutexGuard, PendingAcquire};

/// What a branch's `subscribe` call discovered.
pub enum Subscribed {
    /// The operation already completed (or definitively failed); no need to suspend.
    Ready,
    /// Nothing available yet; a wait structure now references this branch.
    Pending,
}

/// One arm of a `select_any` round. Object-safe so [`select_any`] can drive an
/// arbitrary mix of read/write/timer/channel/lock branches through one loop.
pub trait SelectBranch {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed;
    /// Called on every branch that did not win the round. By construction at most one
    /// branch ever reports `Ready`, and that branch always wins, so `cancel` is only
    /// ever reached for branches that were `Pending`.
    fn cancel(&mut self);
}

/// Runs the two-phase protocol over `branches` in order and returns the index of the
/// winner. Suspends the calling routine if (and only if) every branch reported
/// `Pending`.
///
/// # Panics
/// Panics if called from outside a running routine and at least one branch needs to
/// suspend (a round where the very first branch is immediately `Ready` never touches
/// the coroutine machinery at all).
pub fn select_any(branches: &mut [&mut dyn SelectBranch]) -> usize {
    for (index, branch) in branches.iter_mut().enumerate() {
        if let Subscribed::Ready = branch.subscribe(index) {
            for other in branches.iter_mut() {
                other.cancel();
            }
            return index;
        }
    }
    let info = suspend_current(Suspend::WaitEvents);
    for (index, branch) in branches.iter_mut().enumerate() {
        if index != info.happened_index {
            branch.cancel();
        }
    }
    info.happened_index
}

fn current_routine() -> RoutineHandle {
    crate::routine::with_current(|ctx| ctx.routine.clone())
}

/// Checks fd readiness with a zero-timeout `poll(2)` rather than a zero-length `read`,
/// which on some fd types (regular files) reports ready regardless of actual data
/// availability.
fn poll_ready(fd: RawFd, events: libc::c_short) -> bool {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    // SAFETY: `pfd` is a single valid, stack-local `pollfd`; `poll` writes only its
    // `revents` field.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc > 0 && (pfd.revents & (events | libc::POLLHUP | libc::POLLERR)) != 0
}

pub(crate) fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid, uniquely-borrowed slice for the duration of the call.
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc >= 0 {
        Ok(rc as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid slice for the duration of the call.
    let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if rc >= 0 {
        Ok(rc as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// The readiness-waiting half of a read or write branch, factored out so
/// [`crate::io`]'s internal timed operations can wait on an fd without committing to
/// `read(2)`/`write(2)` specifically (`accept`/`connect`/`send`/`recv` all need the same
/// wait, different syscall).
pub(crate) struct FdWaitBranch {
    fd: RawFd,
    writable: bool,
    event_id: Cell<Option<EventId>>,
}

impl FdWaitBranch {
    pub(crate) fn new(fd: RawFd, writable: bool) -> Self {
        Self { fd, writable, event_id: Cell::new(None) }
    }
}

impl SelectBranch for FdWaitBranch {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        let events = if self.writable { libc::POLLOUT } else { libc::POLLIN };
        if poll_ready(self.fd, events) {
            return Subscribed::Ready;
        }
        let routine = current_routine();
        let id = with_inner(|inner| {
            inner.event_loop.register(self.fd, !self.writable, self.writable, routine, branch_index)
        });
        match id {
            Ok(id) => self.event_id.set(Some(id)),
            Err(source) => fatal(RuntimeError::ReadinessFacilityMisuse(format!(
                "registering fd {} for select failed: {source}",
                self.fd
            ))),
        }
        Subscribed::Pending
    }

    fn cancel(&mut self) {
        if let Some(id) = self.event_id.take() {
            with_inner(|inner| {
                let _ = inner.event_loop.unregister(id);
            });
        }
    }
}

/// Non-blocking read branch. Owns the destination buffer for its lifetime so `finish`
/// needs no extra arguments once the branch has won.
pub struct ReadBranch<'a> {
    inner: FdWaitBranch,
    fd: RawFd,
    buf: &'a mut [u8],
}

impl<'a> ReadBranch<'a> {
    #[must_use]
    pub fn new(fd: RawFd, buf: &'a mut [u8]) -> Self {
        Self { inner: FdWaitBranch::new(fd, false), fd, buf }
    }

    /// Performs the read now that this branch is known to be readable (or the round
    /// resumed because of an error/hangup condition on this fd).
    pub fn finish(&mut self) -> io::Result<usize> {
        read_nonblocking(self.fd, self.buf)
    }
}

impl SelectBranch for ReadBranch<'_> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        self.inner.subscribe(branch_index)
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// Non-blocking write branch, the write-side mirror of [`ReadBranch`].
pub struct WriteBranch<'a> {
    inner: FdWaitBranch,
    fd: RawFd,
    buf: &'a [u8],
}

impl<'a> WriteBranch<'a> {
    #[must_use]
    pub fn new(fd: RawFd, buf: &'a [u8]) -> Self {
        Self { inner: FdWaitBranch::new(fd, true), fd, buf }
    }

    pub fn finish(&mut self) -> io::Result<usize> {
        write_nonblocking(self.fd, self.buf)
    }
}

impl SelectBranch for WriteBranch<'_> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        self.inner.subscribe(branch_index)
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// A deadline branch: fires once, used both standalone (`sleep`) and as the timeout arm
/// of a larger `select_any!` round.
pub struct TimerBranch {
    deadline: Deadline,
    timer_id: Cell<Option<TimerId>>,
}

impl TimerBranch {
    #[must_use]
    pub fn new(deadline: Deadline) -> Self {
        Self { deadline, timer_id: Cell::new(None) }
    }

    pub fn finish(&mut self) {}
}

impl SelectBranch for TimerBranch {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        if self.deadline.has_passed() {
            return Subscribed::Ready;
        }
        let routine = current_routine();
        let id = with_inner(|inner| inner.timers.register(self.deadline, routine, branch_index));
        self.timer_id.set(Some(id));
        Subscribed::Pending
    }

    fn cancel(&mut self) {
        if let Some(id) = self.timer_id.take() {
            with_inner(|inner| {
                inner.timers.cancel(id);
            });
        }
    }
}

/// Boxed so a `Cell` can hold it without requiring `PendingAcquire: Copy`.
struct PendingAcquireSlot(PendingAcquire);

/// Receives from a channel as one branch of a larger select round.
pub struct RecvBranch<'a, T, const N: usize> {
    channel: &'a Channel<T, N>,
    pending: Cell<Option<PendingAcquireSlot>>,
    value: Cell<Option<Option<T>>>,
}

impl<'a, T, const N: usize> RecvBranch<'a, T, N> {
    #[must_use]
    pub fn new(channel: &'a Channel<T, N>) -> Self {
        Self { channel, pending: Cell::new(None), value: Cell::new(None) }
    }

    /// The received value, or `None` if the channel was closed and empty.
    pub fn finish(&mut self) -> Option<T> {
        self.value.take().flatten()
    }
}

impl<T, const N: usize> SelectBranch for RecvBranch<'_, T, N> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        match self.channel.items_semaphore().attempt_acquire(branch_index) {
            AcquireAttempt::Acquired => {
                let value = if self.channel.is_closed_flag() && self.channel.len() == 0 {
                    // Woken only by `close()`'s phantom permits; nothing was enqueued.
                    self.channel.items_semaphore().post();
                    None
                } else {
                    Some(self.channel.pop_locked())
                };
                self.value.set(Some(value));
                Subscribed::Ready
            }
            AcquireAttempt::Pending(pending) => {
                self.pending.set(Some(PendingAcquireSlot(pending)));
                Subscribed::Pending
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(PendingAcquireSlot(pending)) = self.pending.take() {
            self.channel.items_semaphore().cancel_pending(&pending);
        }
    }
}

/// Sends to a channel as one branch of a larger select round. The value is moved in at
/// construction and sent the moment this branch wins.
pub struct SendBranch<'a, T, const N: usize> {
    channel: &'a Channel<T, N>,
    value: Cell<Option<T>>,
    pending: Cell<Option<PendingAcquireSlot>>,
    sent: Cell<bool>,
}

impl<'a, T, const N: usize> SendBranch<'a, T, N> {
    #[must_use]
    pub fn new(channel: &'a Channel<T, N>, value: T) -> Self {
        Self { channel, value: Cell::new(Some(value)), pending: Cell::new(None), sent: Cell::new(false) }
    }

    /// Whether the value was actually enqueued (`false` if the channel closed before
    /// this branch could complete; the value is then lost, matching `Channel::send`'s
    /// own `ChannelClosed` behavior).
    pub fn finish(&mut self) -> bool {
        self.sent.get()
    }
}

impl<T, const N: usize> SelectBranch for SendBranch<'_, T, N> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        match self.channel.space_semaphore().attempt_acquire(branch_index) {
            AcquireAttempt::Acquired => {
                if self.channel.is_closed_flag() {
                    self.channel.space_semaphore().post();
                    self.sent.set(false);
                } else if let Some(value) = self.value.take() {
                    self.channel.push_locked(value);
                    self.channel.items_semaphore().post();
                    self.sent.set(true);
                }
                Subscribed::Ready
            }
            AcquireAttempt::Pending(pending) => {
                self.pending.set(Some(PendingAcquireSlot(pending)));
                Subscribed::Pending
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(PendingAcquireSlot(pending)) = self.pending.take() {
            self.channel.space_semaphore().cancel_pending(&pending);
        }
    }
}

/// Acquires a mutex as one branch of a larger select round.
pub struct LockBranch<'a, T> {
    mutex: &'a Mutex<T>,
    pending: Cell<Option<PendingAcquireSlot>>,
    acquired: Cell<bool>,
}

impl<'a, T> LockBranch<'a, T> {
    #[must_use]
    pub fn new(mutex: &'a Mutex<T>) -> Self {
        Self { mutex, pending: Cell::new(None), acquired: Cell::new(false) }
    }

    pub fn finish(&mut self) -> MutexGuard<'a, T> {
        debug_assert!(self.acquired.get());
        MutexGuard::new(self.mutex)
    }
}

impl<T> SelectBranch for LockBranch<'_, T> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        match self.mutex.semaphore().attempt_acquire(branch_index) {
            AcquireAttempt::Acquired => {
                self.acquired.set(true);
                Subscribed::Ready
            }
            AcquireAttempt::Pending(pending) => {
                self.pending.set(Some(PendingAcquireSlot(pending)));
                Subscribed::Pending
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(PendingAcquireSlot(pending)) = self.pending.take() {
            self.mutex.semaphore().cancel_pending(&pending);
        } else if self.acquired.get() {
            // Won synchronously during `subscribe` but the caller dropped the branch
            // without calling `finish` (the macro always does; this only guards
            // hand-written uses of the type directly).
            self.mutex.semaphore().post();
        }
    }
}

/// Accepts a connection on listening socket `fd` as one branch of a larger select round.
pub struct AcceptBranch {
    inner: FdWaitBranch,
    fd: RawFd,
}

impl AcceptBranch {
    #[must_use]
    pub fn new(fd: RawFd) -> Self {
        Self { inner: FdWaitBranch::new(fd, false), fd }
    }

    pub fn finish(&mut self) -> io::Result<RawFd> {
        crate::io::accept_nonblocking(self.fd)
    }
}

impl SelectBranch for AcceptBranch {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        self.inner.subscribe(branch_index)
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// Connects socket `fd` to `addr` as one branch of a larger select round. Performs the
/// one permitted `connect(2)` call during `subscribe` itself (retrying it after
/// `EINPROGRESS` is undefined behavior), then only waits for writability; `finish`
/// resolves the outcome via `getsockopt(SO_ERROR)` when the wait was what won the round.
pub struct ConnectBranch<'a> {
    inner: FdWaitBranch,
    fd: RawFd,
    addr: &'a std::net::SocketAddr,
    outcome: Cell<Option<io::Result<()>>>,
}

impl<'a> ConnectBranch<'a> {
    #[must_use]
    pub fn new(fd: RawFd, addr: &'a std::net::SocketAddr) -> Self {
        Self { inner: FdWaitBranch::new(fd, true), fd, addr, outcome: Cell::new(None) }
    }

    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match crate::io::socket_error(self.fd) {
            Ok(0) => Ok(()),
            Ok(errno) => Err(io::Error::from_raw_os_error(errno)),
            Err(err) => Err(err),
        }
    }
}

impl SelectBranch for ConnectBranch<'_> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        match crate::io::connect_nonblocking(self.fd, self.addr) {
            Ok(()) => {
                self.outcome.set(Some(Ok(())));
                Subscribed::Ready
            }
            Err(err) if err.raw_os_error() != Some(libc::EINPROGRESS) => {
                self.outcome.set(Some(Err(err)));
                Subscribed::Ready
            }
            Err(_) => self.inner.subscribe(branch_index),
        }
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// Non-blocking `send(2)` branch, the socket-flags-aware sibling of [`WriteBranch`].
pub struct IoSendBranch<'a> {
    inner: FdWaitBranch,
    fd: RawFd,
    buf: &'a [u8],
    flags: i32,
}

impl<'a> IoSendBranch<'a> {
    #[must_use]
    pub fn new(fd: RawFd, buf: &'a [u8], flags: i32) -> Self {
        Self { inner: FdWaitBranch::new(fd, true), fd, buf, flags }
    }

    pub fn finish(&mut self) -> io::Result<usize> {
        crate::io::send_nonblocking(self.fd, self.buf, self.flags)
    }
}

impl SelectBranch for IoSendBranch<'_> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        self.inner.subscribe(branch_index)
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// Non-blocking `recv(2)` branch, the socket-flags-aware sibling of [`ReadBranch`].
pub struct IoRecvBranch<'a> {
    inner: FdWaitBranch,
    fd: RawFd,
    buf: &'a mut [u8],
    flags: i32,
}

impl<'a> IoRecvBranch<'a> {
    #[must_use]
    pub fn new(fd: RawFd, buf: &'a mut [u8], flags: i32) -> Self {
        Self { inner: FdWaitBranch::new(fd, false), fd, buf, flags }
    }

    pub fn finish(&mut self) -> io::Result<usize> {
        crate::io::recv_nonblocking(self.fd, self.buf, self.flags)
    }
}

impl SelectBranch for IoRecvBranch<'_> {
    fn subscribe(&mut self, branch_index: usize) -> Subscribed {
        self.inner.subscribe(branch_index)
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// Declaratively builds and runs a one-shot `select_any` round of 1 to 5 arms. Each arm
/// names a branch constructor and a closure run only for the winning arm, passed that
/// branch's `finish()` result:
///
/// ```ignore
/// let mut buf = [0u8; 64];
/// let n = select_any! {
///     read(fd, &mut buf) => |result: std::io::Result<usize>| result,
///     timeout(Deadline::after(Duration::from_millis(50))) => |()| Ok(0),
/// };
/// ```
///
/// All arms must evaluate to the same type, exactly like a `match`. Supported branch
/// kinds: `read(fd, buf)`, `write(fd, buf)`, `timeout(deadline)`, `recv(channel)`,
/// `send(channel, value)`, `lock(mutex)`, `accept(fd)`, `connect(fd, addr)`,
/// `io_send(fd, buf, flags)`, `io_recv(fd, buf, flags)`.
#[macro_export]
macro_rules! select_any {
    ($k1:ident($($a1:expr),* $(,)?) => $b1:expr $(,)?) => {{
        let mut __b1 = $crate::select_any!(@make $k1($($a1),*));
        let mut __refs: [&mut dyn $crate::select::SelectBranch; 1] = [&mut __b1];
        let __winner = $crate::select::select_any(&mut __refs);
        drop(__refs);
        #[allow(clippy::match_single_binding)]
        match __winner {
            0 => { let f = $b1; f(__b1.finish()) }
            _ => unreachable!("select_any returned an out-of-range branch index"),
        }
    }};

    ($k1:ident($($a1:expr),* $(,)?) => $b1:expr,
     $k2:ident($($a2:expr),* $(,)?) => $b2:expr $(,)?) => {{
        let mut __b1 = $crate::select_any!(@make $k1($($a1),*));
        let mut __b2 = $crate::select_any!(@make $k2($($a2),*));
        let mut __refs: [&mut dyn $crate::select::SelectBranch; 2] = [&mut __b1, &mut __b2];
        let __winner = $crate::select::select_any(&mut __refs);
        drop(__refs);
        match __winner {
            0 => { let f = $b1; f(__b1.finish()) }
            1 => { let f = $b2; f(__b2.finish()) }
            _ => unreachable!("select_any returned an out-of-range branch index"),
        }
    }};

    ($k1:ident($($a1:expr),* $(,)?) => $b1:expr,
     $k2:ident($($a2:expr),* $(,)?) => $b2:expr,
     $k3:ident($($a3:expr),* $(,)?) => $b3:expr $(,)?) => {{
        let mut __b1 = $crate::select_any!(@make $k1($($a1),*));
        let mut __b2 = $crate::select_any!(@make $k2($($a2),*));
        let mut __b3 = $crate::select_any!(@make $k3($($a3),*));
        let mut __refs: [&mut dyn $crate::select::SelectBranch; 3] = [&mut __b1, &mut __b2, &mut __b3];
        let __winner = $crate::select::select_any(&mut __refs);
        drop(__refs);
        match __winner {
            0 => { let f = $b1; f(__b1.finish()) }
            1 => { let f = $b2; f(__b2.finish()) }
            2 => { let f = $b3; f(__b3.finish()) }
            _ => unreachable!("select_any returned an out-of-range branch index"),
        }
    }};

    ($k1:ident($($a1:expr),* $(,)?) => $b1:expr,
     $k2:ident($($a2:expr),* $(,)?) => $b2:expr,
     $k3:ident($($a3:expr),* $(,)?) => $b3:expr,
     $k4:ident($($a4:expr),* $(,)?) => $b4:expr $(,)?) => {{
        let mut __b1 = $crate::select_any!(@make $k1($($a1),*));
        let mut __b2 = $crate::select_any!(@make $k2($($a2),*));
        let mut __b3 = $crate::select_any!(@make $k3($($a3),*));
        let mut __b4 = $crate::select_any!(@make $k4($($a4),*));
        let mut __refs: [&mut dyn $crate::select::SelectBranch; 4] =
            [&mut __b1, &mut __b2, &mut __b3, &mut __b4];
        let __winner = $crate::select::select_any(&mut __refs);
        drop(__refs);
        match __winner {
            0 => { let f = $b1; f(__b1.finish()) }
            1 => { let f = $b2; f(__b2.finish()) }
            2 => { let f = $b3; f(__b3.finish()) }
            3 => { let f = $b4; f(__b4.finish()) }
            _ => unreachable!("select_any returned an out-of-range branch index"),
        }
    }};

    ($k1:ident($($a1:expr),* $(,)?) => $b1:expr,
     $k2:ident($($a2:expr),* $(,)?) => $b2:expr,
     $k3:ident($($a3:expr),* $(,)?) => $b3:expr,
     $k4:ident($($a4:expr),* $(,)?) => $b4:expr,
     $k5:ident($($a5:expr),* $(,)?) => $b5:expr $(,)?) => {{
        let mut __b1 = $crate::select_any!(@make $k1($($a1),*));
        let mut __b2 = $crate::select_any!(@make $k2($($a2),*));
        let mut __b3 = $crate::select_any!(@make $k3($($a3),*));
        let mut __b4 = $crate::select_any!(@make $k4($($a4),*));
        let mut __b5 = $crate::select_any!(@make $k5($($a5),*));
        let mut __refs: [&mut dyn $crate::select::SelectBranch; 5] =
            [&mut __b1, &mut __b2, &mut __b3, &mut __b4, &mut __b5];
        let __winner = $crate::select::select_any(&mut __refs);
        drop(__refs);
        match __winner {
            0 => { let f = $b1; f(__b1.finish()) }
            1 => { let f = $b2; f(__b2.finish()) }
            2 => { let f = $b3; f(__b3.finish()) }
            3 => { let f = $b4; f(__b4.finish()) }
            4 => { let f = $b5; f(__b5.finish()) }
            _ => unreachable!("select_any returned an out-of-range branch index"),
        }
    }};

    (@make read($fd:expr, $buf:expr)) => {
        $crate::select::ReadBranch::new($fd, $buf)
    };
    (@make write($fd:expr, $buf:expr)) => {
        $crate::select::WriteBranch::new($fd, $buf)
    };
    (@make timeout($deadline:expr)) => {
        $crate::select::TimerBranch::new($deadline)
    };
    (@make recv($chan:expr)) => {
        $crate::select::RecvBranch::new($chan)
    };
    (@make send($chan:expr, $value:expr)) => {
        $crate::select::SendBranch::new($chan, $value)
    };
    (@make lock($mutex:expr)) => {
        $crate::select::LockBranch::new($mutex)
    };
    (@make accept($fd:expr)) => {
        $crate::select::AcceptBranch::new($fd)
    };
    (@make connect($fd:expr, $addr:expr)) => {
        $crate::select::ConnectBranch::new($fd, $addr)
    };
    (@make io_send($fd:expr, $buf:expr, $flags:expr)) => {
        $crate::select::IoSendBranch::new($fd, $buf, $flags)
    };
    (@make io_recv($fd:expr, $buf:expr, $flags:expr)) => {
        $crate::select::IoRecvBranch::new($fd, $buf, $flags)
    };
}
