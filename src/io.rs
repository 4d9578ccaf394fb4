//! Non-blocking POSIX-style I/O wrappers (spec §6), grounded on `syscalls.h`'s
//! `read`/`write`/`accept`/`connect`/`send`/`recv` signatures and their shared
//! `-ETIMEDOUT`/`-EINTR` sentinel convention. Every wrapper suspends the calling routine
//! rather than the OS thread while its fd is not ready, and accepts the same
//! three-way timeout encoding as the original: `timeout_ms < 0` waits indefinitely,
//! `== 0` attempts the syscall once and returns immediately, `> 0` bounds the wait.
//!
//! The fd must already be in non-blocking mode; these wrappers never set it themselves
//! (mirroring the source, which leaves fd configuration to the caller).

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{EBADF_SENTINEL, EINTR_SENTINEL, ETIMEDOUT_SENTINEL};
use crate::routine::{suspend_current, Suspend};
use crate::scheduler::timer::Deadline;
use crate::select::{select_any, FdWaitBranch, SelectBranch, TimerBranch};

fn classify_err(err: &io::Error) -> isize {
    let errno = err.raw_os_error().unwrap_or(libc::EIO);
    -(errno as isize)
}

/// What to report when a wait was interrupted by an `fd_panic`/hangup wake rather than
/// ordinary readiness: one more syscall attempt distinguishes "the fd is simply gone"
/// (`EBADF`) from every other interruption, which is reported as `EINTR`.
fn interrupted_result(mut attempt: impl FnMut() -> io::Result<isize>) -> isize {
    match attempt() {
        Ok(n) => n,
        Err(err) if err.raw_os_error() == Some(libc::EBADF) => bad_fd(),
        Err(_) => EINTR_SENTINEL,
    }
}

/// Runs `attempt` until it produces a definitive result, suspending the calling
/// routine on `EAGAIN`/`EWOULDBLOCK` per `timeout_ms`'s three-way encoding.
fn perform(fd: RawFd, writable: bool, timeout_ms: i64, mut attempt: impl FnMut() -> io::Result<isize>) -> isize {
    match attempt() {
        Ok(n) => return n,
        Err(err) if err.kind() != io::ErrorKind::WouldBlock => return classify_err(&err),
        Err(_) => {}
    }

    if timeout_ms == 0 {
        return -(libc::EAGAIN as isize);
    }

    if timeout_ms < 0 {
        loop {
            let suspend = if writable { Suspend::WaitSysWrite { fd } } else { Suspend::WaitSysRead { fd } };
            let info = suspend_current(suspend);
            if info.panic {
                return interrupted_result(&mut attempt);
            }
            match attempt() {
                Ok(n) => return n,
                Err(err) if err.kind() != io::ErrorKind::WouldBlock => return classify_err(&err),
                Err(_) => continue,
            }
        }
    }

    let deadline = Deadline::after(Duration::from_millis(timeout_ms as u64));
    loop {
        let mut io_branch = FdWaitBranch::new(fd, writable);
        let mut timer_branch = TimerBranch::new(deadline);
        let mut refs: [&mut dyn SelectBranch; 2] = [&mut io_branch, &mut timer_branch];
        let winner = select_any(&mut refs);
        drop(refs);
        if winner == 1 {
            timer_branch.finish();
            return ETIMEDOUT_SENTINEL;
        }
        match attempt() {
            Ok(n) => return n,
            Err(err) if err.kind() != io::ErrorKind::WouldBlock => return classify_err(&err),
            Err(_) => continue,
        }
    }
}

/// Reads into `buf`, suspending while `fd` has nothing available.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn read(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> isize {
    perform(fd, false, timeout_ms, || crate::select::read_nonblocking(fd, buf).map(|n| n as isize))
}

/// Writes from `buf`, suspending while `fd` is not writable.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn write(fd: RawFd, buf: &[u8], timeout_ms: i64) -> isize {
    perform(fd, true, timeout_ms, || crate::select::write_nonblocking(fd, buf).map(|n| n as isize))
}

/// Accepts one connection on listening socket `fd`, returning the new connection's fd
/// (as a non-negative `isize`) or a negative sentinel.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn accept(fd: RawFd, timeout_ms: i64) -> isize {
    perform(fd, false, timeout_ms, || accept_nonblocking(fd).map(|new_fd| new_fd as isize))
}

/// Connects socket `fd` to `addr`. Unlike the other wrappers, a non-blocking `connect`
/// only ever needs one real syscall plus (at most) one writable wait — retrying
/// `connect(2)` itself after `EINPROGRESS` is undefined behavior on most platforms, so
/// this does not loop the way [`read`]/[`write`]/[`accept`] do.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn connect(fd: RawFd, addr: &SocketAddr, timeout_ms: i64) -> isize {
    match connect_nonblocking(fd, addr) {
        Ok(()) => return 0,
        Err(err) if err.raw_os_error() != Some(libc::EINPROGRESS) => return classify_err(&err),
        Err(_) => {}
    }

    if timeout_ms == 0 {
        return -(libc::EINPROGRESS as isize);
    }

    if timeout_ms < 0 {
        let info = suspend_current(Suspend::WaitSysWrite { fd });
        if info.panic {
            return EINTR_SENTINEL;
        }
        return finish_connect(fd);
    }

    let deadline = Deadline::after(Duration::from_millis(timeout_ms as u64));
    let mut io_branch = FdWaitBranch::new(fd, true);
    let mut timer_branch = TimerBranch::new(deadline);
    let mut refs: [&mut dyn SelectBranch; 2] = [&mut io_branch, &mut timer_branch];
    let winner = select_any(&mut refs);
    drop(refs);
    if winner == 1 {
        timer_branch.finish();
        return ETIMEDOUT_SENTINEL;
    }
    finish_connect(fd)
}

fn finish_connect(fd: RawFd) -> isize {
    match socket_error(fd) {
        Ok(0) => 0,
        Ok(errno) => -(errno as isize),
        Err(err) => classify_err(&err),
    }
}

/// Sends `buf` on socket `fd` with the given `send(2)` flags.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn send(fd: RawFd, buf: &[u8], flags: i32, timeout_ms: i64) -> isize {
    perform(fd, true, timeout_ms, || send_nonblocking(fd, buf, flags).map(|n| n as isize))
}

/// Receives into `buf` on socket `fd` with the given `recv(2)` flags.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32, timeout_ms: i64) -> isize {
    perform(fd, false, timeout_ms, || recv_nonblocking(fd, buf, flags).map(|n| n as isize))
}

/// Voluntarily reschedules the calling routine at the back of its thread's ready queue.
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn yield_now() {
    suspend_current(Suspend::Yield);
}

/// Suspends the calling routine until the monotonic clock reaches `Instant::now() +
/// duration`, implemented as a single-branch select over nothing but a timer (spec
/// §4.4).
///
/// # Panics
/// Panics if called from outside a running routine.
pub fn sleep(duration: Duration) {
    let deadline = Deadline::after(duration);
    if deadline.has_passed() {
        return;
    }
    let mut branch = TimerBranch::new(deadline);
    let mut refs: [&mut dyn SelectBranch; 1] = [&mut branch];
    let _ = select_any(&mut refs);
}

pub(crate) fn accept_nonblocking(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: a null addr/addrlen pair is valid per accept(2) when the peer address is
    // not needed.
    let rc = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if rc >= 0 {
        Ok(rc)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn connect_nonblocking(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    // SAFETY: `storage` is a valid `sockaddr_storage` of at least `len` initialized
    // bytes for the address family written into it by `sockaddr_from`.
    let rc = unsafe { libc::connect(fd, std::ptr::addr_of!(storage).cast(), len) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn send_nonblocking(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    // SAFETY: `buf` is a valid slice for the duration of the call.
    let rc = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) };
    if rc >= 0 {
        Ok(rc as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn recv_nonblocking(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    // SAFETY: `buf` is a valid, uniquely-borrowed slice for the duration of the call.
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) };
    if rc >= 0 {
        Ok(rc as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut errno: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `errno`/`len` are valid, uniquely-borrowed stack locations of the sizes
    // `getsockopt` expects for `SOL_SOCKET`/`SO_ERROR`.
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, std::ptr::addr_of_mut!(errno).cast(), &mut len)
    };
    if rc == 0 {
        Ok(errno)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Builds a `sockaddr_storage` + length pair the way `std::net`'s own socket internals
/// do, since `std::net::SocketAddr` exposes no public conversion to a raw `sockaddr`.
fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: an all-zero `sockaddr_storage` is a valid bit pattern; only the fields
    // written below are ever read back.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            // SAFETY: `storage` is large enough to hold a `sockaddr_in` (guaranteed by
            // `sockaddr_storage`'s definition) and is exclusively borrowed here.
            unsafe { std::ptr::write(std::ptr::addr_of_mut!(storage).cast(), sin) };
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: as above, for the `sockaddr_in6` layout.
            unsafe { std::ptr::write(std::ptr::addr_of_mut!(storage).cast(), sin6) };
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

/// Returns [`EBADF_SENTINEL`] — kept as a named helper (rather than inlined at call
/// sites) so the one place that needs to distinguish "fd already invalid" from a
/// generic `fd_panic` interruption is easy to find.
#[must_use]
pub(crate) const fn bad_fd() -> isize {
    EBADF_SENTINEL
}
