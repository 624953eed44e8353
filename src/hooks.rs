//! Syscall interception.
//!
//! Grounded on `original_source/code/hook/hook.cpp` for the `dlsym(RTLD_NEXT,
//! ...)` resolution table and the `do_io`-style retry loop (SPEC_FULL.md
//! §4.5). Every hook preserves the POSIX `-1`/`errno` calling convention —
//! none of these return `Result` — so that a caller written against plain
//! libc semantics works unmodified whether or not hooks are active on its
//! thread.

use std::ffi::CString;
use std::io;
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::{Arc, Mutex, OnceLock};

use libc::{iovec, sockaddr, socklen_t, timespec, useconds_t};

use crate::config;
use crate::environment;
use crate::error::{Result, RuntimeError};
use crate::fd_manager;
use crate::fiber;
use crate::io_manager::{self, Event, READ, WRITE};
use crate::scheduler::Affinity;

macro_rules! real_fns {
    ($($field:ident : $ty:ty = $name:literal),+ $(,)?) => {
        // `recvfrom`/`recvmsg`/`sendto`/`sendmsg` are resolved (SPEC_FULL.md
        // §6 requires every symbol's resolution to be fatal-checked) but have
        // no public wrapping hook, so their fields go unread.
        #[allow(dead_code)]
        struct RealFns {
            $($field: $ty,)+
        }

        impl RealFns {
            fn resolve() -> Result<RealFns> {
                Ok(RealFns {
                    $($field: unsafe { std::mem::transmute::<*mut c_void, $ty>(resolve_symbol($name)?) },)+
                })
            }
        }
    };
}

real_fns! {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint = "sleep",
    usleep: unsafe extern "C" fn(useconds_t) -> c_int = "usleep",
    nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int = "nanosleep",
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int = "socket",
    connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int = "connect",
    accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int = "accept",
    read: unsafe extern "C" fn(c_int, *mut c_void, usize) -> isize = "read",
    write: unsafe extern "C" fn(c_int, *const c_void, usize) -> isize = "write",
    readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> isize = "readv",
    writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> isize = "writev",
    recv: unsafe extern "C" fn(c_int, *mut c_void, usize, c_int) -> isize = "recv",
    recvfrom: unsafe extern "C" fn(c_int, *mut c_void, usize, c_int, *mut sockaddr, *mut socklen_t) -> isize = "recvfrom",
    recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> isize = "recvmsg",
    send: unsafe extern "C" fn(c_int, *const c_void, usize, c_int) -> isize = "send",
    sendto: unsafe extern "C" fn(c_int, *const c_void, usize, c_int, *const sockaddr, socklen_t) -> isize = "sendto",
    sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> isize = "sendmsg",
    close: unsafe extern "C" fn(c_int) -> c_int = "close",
    fcntl: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int = "fcntl",
    ioctl: unsafe extern "C" fn(c_int, libc::c_ulong, *mut c_int) -> c_int = "ioctl",
    getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int = "getsockopt",
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int = "setsockopt",
}

fn resolve_symbol(name: &'static str) -> Result<*mut c_void> {
    let cname = CString::new(name).expect("hook symbol name contains a NUL byte");
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
    if ptr.is_null() {
        Err(RuntimeError::HookResolve(name))
    } else {
        Ok(ptr)
    }
}

static REAL: OnceLock<RealFns> = OnceLock::new();

fn real() -> &'static RealFns {
    REAL.get_or_init(|| RealFns::resolve().expect("failed to resolve a hooked libc symbol"))
}

/// Eagerly resolves every hooked symbol, surfacing failure as a `Result`
/// instead of the lazy path's panic. Call this during startup if you'd
/// rather fail the constructing thread than the first hooked call.
pub fn init() -> Result<()> {
    REAL.get_or_init(|| RealFns::resolve().unwrap_or_else(|e| panic!("{}", e)));
    Ok(())
}

fn set_errno(value: c_int) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

fn last_errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

struct TimerInfo {
    cancelled: Mutex<Option<c_int>>,
}

/// The common read-like/write-like retry algorithm (SPEC_FULL.md §4.5).
/// `attempt` performs the raw syscall and must return its raw result,
/// `-1`/`errno` included.
fn do_io(fd: c_int, direction: Event, timeout_ms: i64, mut attempt: impl FnMut() -> isize) -> isize {
    loop {
        let result = attempt();
        if result >= 0 {
            return result;
        }
        let err = last_errno();
        if err == libc::EINTR {
            continue;
        }
        if err != libc::EAGAIN && err != libc::EWOULDBLOCK {
            return result;
        }

        let manager = match io_manager::current() {
            Some(m) => m,
            None => return result,
        };

        let info = Arc::new(TimerInfo { cancelled: Mutex::new(None) });
        let condition = Arc::new(());

        let timer_handle = if timeout_ms >= 0 {
            let info2 = info.clone();
            let manager2 = manager.clone();
            let weak_condition = Arc::downgrade(&condition);
            Some(manager.add_condition_timer(
                timeout_ms as u64,
                move || {
                    *info2.cancelled.lock().unwrap() = Some(libc::ETIMEDOUT);
                    manager2.cancel_event(fd, direction);
                },
                weak_condition,
                false,
            ))
        } else {
            None
        };

        manager.add_event(fd, direction, None);
        fiber::yield_to_hold();
        drop(condition);

        if let Some(handle) = &timer_handle {
            handle.cancel();
        }

        if let Some(errno) = *info.cancelled.lock().unwrap() {
            set_errno(errno);
            return -1;
        }
        // Otherwise either real readiness woke us, or a spurious wakeup;
        // either way the top of the loop retries the real syscall.
    }
}

/// Wraps `attempt` (a raw syscall invocation) with the descriptor-table
/// checks common to every read-like/write-like hook: hooks-enabled gate,
/// descriptor lookup, closed check, and the non-socket/user-nonblocking
/// bypass.
fn hooked_io(fd: c_int, direction: Event, attempt: impl FnMut() -> isize) -> isize {
    let mut attempt = attempt;
    if !environment::hooks_enabled() {
        return attempt();
    }
    let entry = match fd_manager::fd_manager().get(fd, false) {
        Some(entry) => entry,
        None => return attempt(),
    };
    let guard = entry.lock().unwrap();
    if guard.is_closed() {
        drop(guard);
        set_errno(libc::EBADF);
        return -1;
    }
    if guard.bypasses_hooks() {
        drop(guard);
        return attempt();
    }
    let timeout_ms = if direction == READ {
        guard.recv_timeout_ms()
    } else {
        guard.send_timeout_ms()
    };
    drop(guard);
    do_io(fd, direction, timeout_ms, &mut attempt)
}

pub unsafe fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize {
    hooked_io(fd, READ, || (real().read)(fd, buf, count))
}

pub unsafe fn write(fd: c_int, buf: *const c_void, count: usize) -> isize {
    hooked_io(fd, WRITE, || (real().write)(fd, buf, count))
}

pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> isize {
    hooked_io(fd, READ, || (real().readv)(fd, iov, iovcnt))
}

pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> isize {
    hooked_io(fd, WRITE, || (real().writev)(fd, iov, iovcnt))
}

pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> isize {
    hooked_io(fd, READ, || (real().recv)(fd, buf, len, flags))
}

pub unsafe fn send(fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> isize {
    hooked_io(fd, WRITE, || (real().send)(fd, buf, len, flags))
}

pub unsafe fn socket(domain: c_int, socket_type: c_int, protocol: c_int) -> c_int {
    let fd = (real().socket)(domain, socket_type, protocol);
    if fd >= 0 {
        fd_manager::fd_manager().get(fd, true);
    }
    fd
}

pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let result = hooked_io(fd, READ, || (real().accept)(fd, addr, addrlen) as isize);
    if result >= 0 {
        fd_manager::fd_manager().get(result as c_int, true);
    }
    result as c_int
}

pub unsafe fn close(fd: c_int) -> c_int {
    if let Some(manager) = io_manager::current() {
        manager.cancel_all(fd);
    }
    fd_manager::fd_manager().remove(fd);
    (real().close)(fd)
}

/// Non-blocking connect: issues the real `connect`, and if it would block
/// (`EINPROGRESS`), parks on a WRITE event plus an optional connect-timeout
/// condition timer, then resolves the outcome via `SO_ERROR`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    if !environment::hooks_enabled() {
        return (real().connect)(fd, addr, len);
    }
    let entry = match fd_manager::fd_manager().get(fd, false) {
        Some(entry) => entry,
        None => return (real().connect)(fd, addr, len),
    };
    if entry.lock().unwrap().bypasses_hooks() {
        return (real().connect)(fd, addr, len);
    }

    let rc = (real().connect)(fd, addr, len);
    if rc == 0 {
        return 0;
    }
    if last_errno() != libc::EINPROGRESS {
        return rc;
    }

    let manager = match io_manager::current() {
        Some(m) => m,
        None => return rc,
    };

    let info = Arc::new(TimerInfo { cancelled: Mutex::new(None) });
    let condition = Arc::new(());
    let weak_condition = Arc::downgrade(&condition);
    let timeout_ms = config::TCP_CONNECT_TIMEOUT_MS.get();
    let info2 = info.clone();
    let manager2 = manager.clone();
    let timer_handle = manager.add_condition_timer(
        timeout_ms,
        move || {
            *info2.cancelled.lock().unwrap() = Some(libc::ETIMEDOUT);
            manager2.cancel_event(fd, WRITE);
        },
        weak_condition,
        false,
    );

    manager.add_event(fd, WRITE, None);
    fiber::yield_to_hold();
    drop(condition);
    timer_handle.cancel();

    if let Some(errno) = *info.cancelled.lock().unwrap() {
        set_errno(errno);
        return -1;
    }

    let mut sock_err: c_int = 0;
    let mut sock_err_len = std::mem::size_of::<c_int>() as socklen_t;
    (real().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut sock_err as *mut c_int as *mut c_void,
        &mut sock_err_len,
    );
    if sock_err != 0 {
        set_errno(sock_err);
        return -1;
    }
    0
}

/// `F_SETFL`/`F_GETFL` intercept the `O_NONBLOCK` bit: the kernel-level flag
/// is always forced on for managed sockets, while the user-visible flag
/// tracks what the caller last asked for.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    if cmd == libc::F_SETFL {
        let user_wants_nonblock = arg & libc::O_NONBLOCK != 0;
        let is_managed_socket = fd_manager::fd_manager().with_entry_mut(fd, false, |entry| {
            entry.set_user_non_block(user_wants_nonblock);
            entry.is_socket()
        });
        let mut effective = arg;
        if is_managed_socket == Some(true) {
            effective |= libc::O_NONBLOCK;
        }
        return (real().fcntl)(fd, cmd, effective);
    }
    if cmd == libc::F_GETFL {
        let raw = (real().fcntl)(fd, cmd, 0);
        if raw < 0 {
            return raw;
        }
        if let Some(entry) = fd_manager::fd_manager().get(fd, false) {
            let entry = entry.lock().unwrap();
            if entry.is_socket() {
                return if entry.user_non_block() {
                    raw | libc::O_NONBLOCK
                } else {
                    raw & !libc::O_NONBLOCK
                };
            }
        }
        return raw;
    }
    (real().fcntl)(fd, cmd, arg)
}

/// Mirrors `fcntl`'s `F_SETFL`/`O_NONBLOCK` handling for `FIONBIO`.
pub unsafe fn ioctl(fd: c_int, request: libc::c_ulong, arg: *mut c_int) -> c_int {
    if request == libc::FIONBIO as libc::c_ulong && !arg.is_null() {
        let user_wants_nonblock = *arg != 0;
        let is_managed_socket = fd_manager::fd_manager().with_entry_mut(fd, false, |entry| {
            entry.set_user_non_block(user_wants_nonblock);
            entry.is_socket()
        });
        let mut effective: c_int = if is_managed_socket == Some(true) { 1 } else { *arg };
        return (real().ioctl)(fd, request, &mut effective as *mut c_int);
    }
    (real().ioctl)(fd, request, arg)
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` additionally update the descriptor entry's
/// timeout fields, which `do_io` reads on the next blocking call.
pub unsafe fn setsockopt(fd: c_int, level: c_int, optname: c_int, optval: *const c_void, optlen: socklen_t) -> c_int {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        let tv = &*(optval as *const libc::timeval);
        let ms = tv.tv_sec * 1000 + tv.tv_usec / 1000;
        fd_manager::fd_manager().with_entry_mut(fd, true, |entry| {
            if optname == libc::SO_RCVTIMEO {
                entry.set_recv_timeout_ms(ms as i64);
            } else {
                entry.set_send_timeout_ms(ms as i64);
            }
        });
    }
    (real().setsockopt)(fd, level, optname, optval, optlen)
}

fn sleep_cooperatively(ms: u64) {
    let manager = match io_manager::current() {
        Some(m) => m,
        None => {
            std::thread::sleep(std::time::Duration::from_millis(ms));
            return;
        }
    };
    match environment::current_task_handle() {
        Some(handle) => {
            let scheduler = manager.scheduler().clone();
            manager.add_timer(
                ms,
                move || {
                    scheduler.schedule_instant(handle, Affinity::Any);
                },
                false,
            );
            fiber::yield_to_hold();
        }
        None => std::thread::sleep(std::time::Duration::from_millis(ms)),
    }
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if !environment::hooks_enabled() {
        return unsafe { (real().sleep)(seconds) };
    }
    sleep_cooperatively(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: useconds_t) -> c_int {
    if !environment::hooks_enabled() {
        return unsafe { (real().usleep)(usec) };
    }
    sleep_cooperatively(usec as u64 / 1000);
    0
}

pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !environment::hooks_enabled() || req.is_null() {
        return (real().nanosleep)(req, rem);
    }
    let req = &*req;
    let ms = (req.tv_sec as u64) * 1000 + (req.tv_nsec as u64) / 1_000_000;
    sleep_cooperatively(ms);
    0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hooks_disabled_by_default_on_a_fresh_thread() {
        assert!(!environment::hooks_enabled());
    }

    #[test]
    fn real_symbols_resolve() {
        // Every hooked symbol must exist in a standard libc; this exercises
        // the resolution path without requiring the scheduler to be running.
        init().unwrap();
    }
}
