//! Integration tests exercising the six concrete scenarios from SPEC_FULL.md
//! §8. These build whole `IoManager`s (each its own worker thread pool, epoll
//! fd, and tickle pipe), so every test here acquires `SERIAL` first: the
//! hook layer reaches "the current I/O manager" through a single process-wide
//! slot (see `io_manager::current`'s doc comment), so two of these tests
//! running concurrently would stomp on each other's reactor.

use std::ffi::c_void;
use std::mem;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hxk_runtime::{hook, Affinity, IoManager, Scheduler, TCP_CONNECT_TIMEOUT_MS};

static SERIAL: Mutex<()> = Mutex::new(());

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Builds a bound, listening TCP socket through the hook layer (so it gets a
/// descriptor-table entry) on an OS-assigned port, returning the fd and the
/// port actually bound.
fn make_listener() -> (i32, u16) {
    unsafe {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket() failed");
        let addr = loopback_addr(0);
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as u32,
        );
        assert_eq!(rc, 0, "bind() failed");

        let mut bound: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len);
        assert_eq!(rc, 0, "getsockname() failed");

        let rc = libc::listen(fd, 16);
        assert_eq!(rc, 0, "listen() failed");
        (fd, u16::from_be(bound.sin_port))
    }
}

fn write_all(fd: i32, mut data: &[u8]) {
    while !data.is_empty() {
        let n = unsafe { hook::write(fd, data.as_ptr() as *const c_void, data.len()) };
        assert!(n >= 0, "write() failed, errno set");
        data = &data[n as usize..];
    }
}

fn read_exact(fd: i32, buf: &mut [u8]) {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe { hook::read(fd, buf[filled..].as_mut_ptr() as *mut c_void, buf.len() - filled) };
        assert!(n >= 0, "read() failed, errno set");
        filled += n as usize;
    }
}

/// Scenario 1: echo loopback. One coroutine writes "ni hao" zero-padded to
/// 1024 bytes; the other reads exactly that many bytes back.
#[test]
fn echo_loopback_reads_padded_message() {
    let _guard = SERIAL.lock().unwrap();

    let (listener, port) = make_listener();
    let io = IoManager::new(2, false, "echo-loopback").unwrap();
    io.start().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    io.scheduler().schedule(move || {
        let client = unsafe {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            let addr = loopback_addr(port);
            hook::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as u32,
            );
            fd
        };
        let mut payload = vec![0u8; 1024];
        payload[..6].copy_from_slice(b"ni hao");
        write_all(client, &payload);
    });

    io.scheduler().schedule(move || {
        let peer = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(peer >= 0, "accept() failed");
        let mut buf = vec![0u8; 1024];
        read_exact(peer, &mut buf);
        *received2.lock().unwrap() = buf;
    });

    std::thread::sleep(Duration::from_millis(300));
    io.stop();

    let buf = received.lock().unwrap();
    assert_eq!(buf.len(), 1024);
    assert_eq!(&buf[..6], b"ni hao");
}

/// Scenario 2: sleep fairness. Three coroutines each sleep ~1s; total wall
/// time should stay near 1s (they sleep concurrently), and their wake times
/// should cluster tightly.
#[test]
fn concurrent_sleeps_run_in_parallel_not_in_series() {
    let _guard = SERIAL.lock().unwrap();

    let io = IoManager::new(3, false, "sleep-fairness").unwrap();
    io.start().unwrap();

    let wake_times = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    for _ in 0..3 {
        let wake_times = wake_times.clone();
        io.scheduler().schedule(move || {
            hook::sleep(1);
            wake_times.lock().unwrap().push(start.elapsed());
        });
    }

    std::thread::sleep(Duration::from_millis(1300));
    io.stop();

    let times = wake_times.lock().unwrap();
    assert_eq!(times.len(), 3);
    for t in times.iter() {
        assert!(t.as_millis() < 1300, "sleep took too long: {:?}", t);
    }
    let spread = times.iter().max().unwrap().as_millis() as i64 - times.iter().min().unwrap().as_millis() as i64;
    assert!(spread < 100, "wake times too spread out: {}ms", spread);
}

/// Scenario 3: periodic timers. A 500ms cyclic timer and a 1000ms cyclic
/// timer both fire repeatedly; cancelling the faster one stops its fires.
#[test]
fn periodic_timers_fire_on_their_own_cadence() {
    let _guard = SERIAL.lock().unwrap();

    let io = IoManager::new(1, false, "periodic-timers").unwrap();
    io.start().unwrap();

    let fast_fires = Arc::new(AtomicUsize::new(0));
    let slow_fires = Arc::new(AtomicUsize::new(0));
    let f2 = fast_fires.clone();
    let s2 = slow_fires.clone();

    let fast_handle = io.add_timer(
        500,
        {
            let f2 = f2.clone();
            move || {
                f2.fetch_add(1, Ordering::SeqCst);
            }
        },
        true,
    );
    io.add_timer(
        1000,
        move || {
            s2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(1700));
    fast_handle.cancel();
    let fast_at_cancel = fast_fires.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(1000));
    io.stop();

    assert!(fast_fires.load(Ordering::SeqCst) >= 2);
    assert_eq!(fast_fires.load(Ordering::SeqCst), fast_at_cancel, "cancelled timer kept firing");
    assert!(slow_fires.load(Ordering::SeqCst) >= 1);
}

/// Scenario 4: connect timeout. Connecting to an unreachable-but-routable
/// test address with a short `tcp.connect.timeout` fails with `ETIMEDOUT`
/// near the configured deadline, without blocking any other coroutine.
#[test]
fn connect_to_unroutable_address_times_out() {
    let _guard = SERIAL.lock().unwrap();

    let previous_timeout = TCP_CONNECT_TIMEOUT_MS.get();
    TCP_CONNECT_TIMEOUT_MS.set(200);

    let io = IoManager::new(2, false, "connect-timeout").unwrap();
    io.start().unwrap();

    let other_ran = Arc::new(AtomicBool::new(false));
    let other2 = other_ran.clone();
    io.scheduler().schedule(move || {
        std::thread::sleep(Duration::from_millis(50));
        other2.store(true, Ordering::SeqCst);
    });

    let result = Arc::new(Mutex::new(None));
    let result2 = result.clone();
    let started = Instant::now();
    io.scheduler().schedule(move || {
        let rc = unsafe {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            // TEST-NET-3 (RFC 5737): routable syntax, no host ever answers.
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 9u16.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(Ipv4Addr::new(203, 0, 113, 1)).to_be(),
                },
                sin_zero: [0; 8],
            };
            hook::connect(fd, &addr as *const _ as *const libc::sockaddr, mem::size_of::<libc::sockaddr_in>() as u32)
        };
        let errno = std::io::Error::last_os_error().raw_os_error();
        *result2.lock().unwrap() = Some((rc, errno, started.elapsed()));
    });

    std::thread::sleep(Duration::from_millis(600));
    io.stop();
    TCP_CONNECT_TIMEOUT_MS.set(previous_timeout);

    assert!(other_ran.load(Ordering::SeqCst), "connect timeout blocked an unrelated coroutine");
    let (rc, errno, elapsed) = result.lock().unwrap().expect("connect coroutine never finished");
    assert_eq!(rc, -1);
    assert_eq!(errno, Some(libc::ETIMEDOUT));
    assert!(elapsed.as_millis() < 500, "timeout fired too late: {:?}", elapsed);
}

/// Scenario 5: cancel-all-on-close. READ and WRITE handlers registered on a
/// descriptor both fire exactly once when the hooked `close` runs.
#[test]
fn closing_a_descriptor_fires_both_registered_handlers() {
    let _guard = SERIAL.lock().unwrap();

    let io = IoManager::new(1, false, "cancel-on-close").unwrap();
    io.start().unwrap();

    let (a, b) = unsafe {
        let mut fds = [0i32; 2];
        let rc = libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr());
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    };
    let _ = a;

    let read_fired = Arc::new(AtomicUsize::new(0));
    let write_fired = Arc::new(AtomicUsize::new(0));
    let (r2, w2) = (read_fired.clone(), write_fired.clone());
    io.add_event(b, hxk_runtime::READ, Some(Box::new(move || { r2.fetch_add(1, Ordering::SeqCst); })));
    io.add_event(b, hxk_runtime::WRITE, Some(Box::new(move || { w2.fetch_add(1, Ordering::SeqCst); })));

    io.scheduler().schedule_with_affinity(
        move || unsafe {
            hook::close(b);
        },
        Affinity::Any,
    );

    std::thread::sleep(Duration::from_millis(200));
    io.stop();

    assert_eq!(read_fired.load(Ordering::SeqCst), 1);
    assert_eq!(write_fired.load(Ordering::SeqCst), 1);
}

/// Scenario 6: scheduler drain. 1024 trivial callables all run exactly once
/// before `stop()` returns.
#[test]
fn scheduler_drains_every_enqueued_callable_before_stopping() {
    let _guard = SERIAL.lock().unwrap();

    let sched = Scheduler::new(2, false, "drain-test");
    sched.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..1024 {
        let counter = counter.clone();
        sched.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    std::thread::sleep(Duration::from_millis(300));
    sched.stop();

    assert_eq!(counter.load(Ordering::SeqCst), 1024);
}
