//! Integration tests for the concrete scenarios enumerated in the design's testable
//! properties section: pipe timeouts, multi-branch `select_any!` races over pipes,
//! channels, timers, closed channels, a mutex pair, a listener/connector race, and an
//! MPMC stress run over a bounded channel.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use boson_rt::{io, select_any, Deadline, Engine, EngineConfig};

fn nonblocking_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid, uniquely-borrowed two-element array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe(2) failed: {}", std::io::Error::last_os_error());
    for fd in fds {
        // SAFETY: `fd` was just created above and is still open.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        // SAFETY: as above.
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    (fds[0], fds[1])
}

fn set_nonblocking(fd: RawFd) {
    // SAFETY: `fd` is a live fd owned by the caller for the duration of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    // SAFETY: as above.
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
}

fn close(fd: RawFd) {
    // SAFETY: caller guarantees `fd` is still open and not used again afterwards.
    unsafe {
        libc::close(fd);
    }
}

fn config(thread_count: usize) -> EngineConfig {
    EngineConfig { thread_count, event_capacity: 64 }
}

#[test]
fn pipe_timeout_then_success() {
    let (read_fd, write_fd) = nonblocking_pipe();
    let first = Arc::new(AtomicI64::new(i64::MIN));
    let second = Arc::new(AtomicI64::new(i64::MIN));

    let mut engine = Engine::new(config(2)).unwrap();
    {
        let first = Arc::clone(&first);
        let second = Arc::clone(&second);
        engine.spawn(move || {
            let mut buf = [0u8; 8];
            let rc = io::read(read_fd, &mut buf, 5);
            first.store(rc as i64, Ordering::SeqCst);

            let rc = io::read(read_fd, &mut buf, -1);
            second.store(rc as i64, Ordering::SeqCst);
        });
    }
    engine.spawn(move || {
        io::sleep(Duration::from_millis(30));
        let rc = io::write(write_fd, b"deadbeef", -1);
        assert_eq!(rc, 8);
    });
    engine.shutdown();

    assert_eq!(first.load(Ordering::SeqCst), -(libc::ETIMEDOUT as i64));
    assert_eq!(second.load(Ordering::SeqCst), 8);

    close(read_fd);
    close(write_fd);
}

#[test]
fn select_on_two_pipes_picks_the_filled_one_first() {
    let (r1, w1) = nonblocking_pipe();
    let (r2, w2) = nonblocking_pipe();
    // Fill pipe 2 up front so the consumer's first select round resolves on it.
    assert_eq!(unsafe { libc::write(w2, b"xy".as_ptr().cast(), 2) }, 2);

    let winners = Arc::new(StdMutex::new(Vec::<i32>::new()));
    let mut engine = Engine::new(config(2)).unwrap();
    let signal = engine.channel::<(), 1>();

    {
        let winners = Arc::clone(&winners);
        let signal = signal.clone();
        engine.spawn(move || {
            let mut buf1 = [0u8; 8];
            let mut buf2 = [0u8; 8];
            let w = select_any! {
                read(r1, &mut buf1) => |_r: std::io::Result<usize>| 1i32,
                read(r2, &mut buf2) => |_r: std::io::Result<usize>| 2i32,
            };
            winners.lock().unwrap().push(w);
            signal.send(()).unwrap();

            let mut buf1 = [0u8; 8];
            let mut buf2 = [0u8; 8];
            let w = select_any! {
                read(r1, &mut buf1) => |_r: std::io::Result<usize>| 1i32,
                read(r2, &mut buf2) => |_r: std::io::Result<usize>| 2i32,
            };
            winners.lock().unwrap().push(w);
        });
    }
    engine.spawn(move || {
        signal.recv().unwrap();
        let rc = io::write(w1, b"z", -1);
        assert_eq!(rc, 1);
    });
    engine.shutdown();

    assert_eq!(*winners.lock().unwrap(), vec![2, 1]);

    close(r1);
    close(w1);
    close(r2);
    close(w2);
}

#[test]
fn select_with_timer_falls_back_when_channels_are_empty() {
    let mut engine = Engine::new(config(2)).unwrap();
    let c1 = engine.channel::<i32, 1>();
    let c2 = engine.channel::<i32, 1>();
    let ticket = engine.channel::<(), 1>();

    let results = Arc::new(StdMutex::new(Vec::<(i32, i32)>::new()));

    {
        let c1 = c1.clone();
        let c2 = c2.clone();
        let ticket = ticket.clone();
        let results = Arc::clone(&results);
        engine.spawn(move || {
            let first = select_any! {
                recv(&c1) => |v: Option<i32>| (1, v.unwrap_or(-1)),
                recv(&c2) => |v: Option<i32>| (2, v.unwrap_or(-1)),
                timeout(Deadline::after(Duration::from_millis(0))) => |()| (3, 0),
            };
            results.lock().unwrap().push(first);
            ticket.send(()).unwrap();

            let second = select_any! {
                recv(&c1) => |v: Option<i32>| (1, v.unwrap_or(-1)),
                recv(&c2) => |v: Option<i32>| (2, v.unwrap_or(-1)),
            };
            results.lock().unwrap().push(second);

            let third = select_any! {
                recv(&c1) => |v: Option<i32>| (1, v.unwrap_or(-1)),
                recv(&c2) => |v: Option<i32>| (2, v.unwrap_or(-1)),
            };
            results.lock().unwrap().push(third);
        });
    }
    engine.spawn(move || {
        ticket.recv().unwrap();
        c1.send(2).unwrap();
        c2.send(3).unwrap();
    });
    engine.shutdown();

    let results = results.lock().unwrap();
    assert_eq!(results[0], (3, 0));
    assert_eq!(results[1], (1, 2));
    assert_eq!(results[2], (2, 3));
}

#[test]
fn select_resolves_immediately_on_a_closed_channel() {
    let mut engine = Engine::new(config(2)).unwrap();
    let c1 = engine.channel::<i32, 1>();
    let c2 = engine.channel::<i32, 1>();
    c2.close();

    let outcomes = Arc::new(StdMutex::new(Vec::<bool>::new()));
    {
        let c1 = c1.clone();
        let c2 = c2.clone();
        let outcomes = Arc::clone(&outcomes);
        engine.spawn(move || {
            let success = select_any! {
                recv(&c1) => |v: Option<i32>| v.is_some(),
                recv(&c2) => |v: Option<i32>| v.is_some(),
            };
            outcomes.lock().unwrap().push(success);

            // Re-running must still resolve immediately on the closed branch.
            let success_again = select_any! {
                recv(&c1) => |v: Option<i32>| v.is_some(),
                recv(&c2) => |v: Option<i32>| v.is_some(),
            };
            outcomes.lock().unwrap().push(success_again);
        });
    }
    engine.shutdown();

    assert_eq!(*outcomes.lock().unwrap(), vec![false, false]);

    // Closing after a pending send makes a write-select on that channel fail too.
    let mut engine2 = Engine::new(config(1)).unwrap();
    let c3 = engine2.channel::<i32, 1>();
    c3.send(1).unwrap(); // fill the one slot
    c3.close();
    let sent = Arc::new(StdMutex::new(None::<bool>));
    {
        let c3 = c3.clone();
        let sent = Arc::clone(&sent);
        engine2.spawn(move || {
            let ok = select_any! {
                send(&c3, 2) => |ok: bool| ok,
            };
            *sent.lock().unwrap() = Some(ok);
        });
    }
    engine2.shutdown();
    assert_eq!(*sent.lock().unwrap(), Some(false));
}

#[test]
fn select_on_a_mutex_pair_picks_whichever_unlocks_first() {
    let mut engine = Engine::new(config(2)).unwrap();
    let m1 = engine.mutex(());
    let m2 = engine.mutex(());
    let winners = Arc::new(StdMutex::new(Vec::<i32>::new()));
    let locked = engine.channel::<(), 1>();
    let release = engine.channel::<i32, 1>();

    // Holder routine: takes both (uncontested) locks, tells the selector it's safe to
    // start, then drops m2 first and m1 second, gated by the selector's own progress so
    // m1 is provably still held throughout the first `select_any` round.
    {
        let m1 = m1.clone();
        let m2 = m2.clone();
        let locked = locked.clone();
        let release = release.clone();
        engine.spawn(move || {
            let g1 = m1.lock();
            let g2 = m2.lock();
            locked.send(()).unwrap();
            drop(g2);
            let first = release.recv().unwrap();
            assert_eq!(first, 2);
            drop(g1);
        });
    }
    let selector_winners = Arc::clone(&winners);
    engine.spawn(move || {
        locked.recv().unwrap();
        let w = select_any! {
            lock(&m1) => |_g| 1i32,
            lock(&m2) => |_g| 2i32,
        };
        selector_winners.lock().unwrap().push(w);
        release.send(w).unwrap();

        let w = select_any! {
            lock(&m1) => |_g| 1i32,
            lock(&m2) => |_g| 2i32,
        };
        selector_winners.lock().unwrap().push(w);
    });
    engine.shutdown();

    assert_eq!(*winners.lock().unwrap(), vec![2, 1]);
}

#[test]
fn accept_then_connect_race_resolves_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();

    // SAFETY: a fresh non-blocking TCP socket, closed explicitly below.
    let sock_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(sock_fd >= 0);
    set_nonblocking(sock_fd);

    let winners = Arc::new(StdMutex::new(Vec::<i32>::new()));
    let mut engine = Engine::new(config(2)).unwrap();
    {
        let winners = Arc::clone(&winners);
        engine.spawn(move || {
            let w = select_any! {
                accept(listen_fd) => |r: std::io::Result<RawFd>| { if let Ok(fd) = r { close(fd); } 1i32 },
                connect(sock_fd, &addr) => |_r: std::io::Result<()>| 2i32,
            };
            winners.lock().unwrap().push(w);
        });
    }
    engine.shutdown();

    // Which of the two branches wins is an OS-level race (the kernel completes the
    // handshake and makes the listener readable/the socket writable close together), so
    // this only checks that exactly one branch resolves the round without hanging —
    // the ordering guarantee itself is covered by `select_on_two_pipes_picks_the_filled_one_first`
    // and `select_on_a_mutex_pair_picks_whichever_unlocks_first`, which control timing
    // deterministically instead of racing the kernel.
    assert_eq!(winners.lock().unwrap().len(), 1);

    close(sock_fd);
    drop(listener);
}

#[test]
fn mpmc_stress_over_a_bounded_channel_preserves_every_item() {
    const PRODUCERS: i64 = 16;
    const CONSUMERS: usize = 16;
    const PER_PRODUCER: i64 = 1000;

    let mut engine = Engine::new(config(4)).unwrap();
    let channel = engine.channel::<i64, 64>();
    let total = Arc::new(AtomicI64::new(0));
    let remaining_consumers = Arc::new(AtomicUsize::new(CONSUMERS));
    let producers_done = Arc::new(AtomicUsize::new(0));

    for p in 0..PRODUCERS {
        let channel = channel.clone();
        let producers_done = Arc::clone(&producers_done);
        engine.spawn(move || {
            for i in 0..PER_PRODUCER {
                channel.send(p + i * PRODUCERS).unwrap();
            }
            producers_done.fetch_add(1, Ordering::SeqCst);
        });
    }
    for _ in 0..CONSUMERS {
        let channel = channel.clone();
        let total = Arc::clone(&total);
        let remaining = Arc::clone(&remaining_consumers);
        engine.spawn(move || {
            let mut local = 0i64;
            while let Some(v) = channel.recv() {
                local += v;
            }
            total.fetch_add(local, Ordering::SeqCst);
            remaining.fetch_sub(1, Ordering::SeqCst);
        });
    }
    // One extra routine closes the channel once every producer is done and the channel
    // has drained, so consumers blocked on an empty channel wake with `None` instead of
    // hanging forever. Gated on `producers_done` rather than a timing guess, so there is
    // no window where the channel looks momentarily empty mid-stream and closes early.
    let closer_channel = channel.clone();
    engine.spawn(move || loop {
        io::sleep(Duration::from_millis(2));
        if producers_done.load(Ordering::SeqCst) == PRODUCERS as usize && closer_channel.is_empty() {
            closer_channel.close();
            break;
        }
    });
    engine.shutdown();

    let expected: i64 = (0..PRODUCERS * PER_PRODUCER).sum();
    assert_eq!(total.load(Ordering::SeqCst), expected);
    assert_eq!(remaining_consumers.load(Ordering::SeqCst), 0);
}

#[test]
fn semaphore_counter_returns_to_its_initial_value() {
    let mut engine = Engine::new(config(1)).unwrap();
    let sem = engine.semaphore(3);
    assert_eq!(sem.available_permits(), 3);

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let sem = sem.clone();
        let done = Arc::clone(&done);
        engine.spawn(move || {
            sem.wait();
            sem.post();
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    engine.shutdown();

    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert_eq!(sem.available_permits(), 3);
}
