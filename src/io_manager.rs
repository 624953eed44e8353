//! The epoll-based reactor.
//!
//! Grounded on `original_source/code/io_manager/io_manager.cpp`/`io_manager.h`
//! for the FD-context shape, the add/remove/cancel event algorithm, the
//! tickle-pipe wakeup mechanism, and the idle-loop structure (SPEC_FULL.md
//! §4.4); composes the `Scheduler` and `TimerManager` rather than
//! subclassing them, and implements `SchedulerHooks` to fuse epoll + timer
//! waiting into the scheduler's idle path, exactly as the original composes
//! (C++ inheritance) `Scheduler` and `TimerManager`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::sync::Mutex;

use crate::environment;
use crate::error::{Result, RuntimeError};
use crate::fiber::{self, Handle};
use crate::scheduler::{Affinity, Scheduler, SchedulerHooks, Task};
use crate::timer::{TimerHandle, TimerManager};

/// Readiness direction bits.
pub type Event = u8;
pub const READ: Event = 0b01;
pub const WRITE: Event = 0b10;

const MAX_WAIT_MS: i32 = 1000;
const MAX_EPOLL_EVENTS: usize = 64;

enum EventHandler {
    Fiber(Handle, Affinity),
    Callback(Box<dyn FnOnce() + Send>),
}

impl EventHandler {
    fn fire(self, scheduler: &Arc<Scheduler>) {
        match self {
            EventHandler::Fiber(handle, affinity) => scheduler.schedule_instant(handle, affinity),
            EventHandler::Callback(cb) => scheduler.schedule(cb),
        }
    }
}

struct FdSlot {
    interest: Event,
    read: Option<EventHandler>,
    write: Option<EventHandler>,
}

struct FdContext {
    slot: Mutex<FdSlot>,
}

/// Composes a `Scheduler` and a `TimerManager` into an epoll-driven reactor.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epoll_fd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    pending_events: AtomicUsize,
}

impl IoManager {
    pub fn new(worker_count: usize, use_caller: bool, name: impl Into<String>) -> Result<Arc<IoManager>> {
        let scheduler = Scheduler::new(worker_count, use_caller, name);

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(RuntimeError::EpollCreate(io::Error::last_os_error()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(RuntimeError::PipeCreate(err));
        }
        let (tickle_read, tickle_write) = (pipe_fds[0], pipe_fds[1]);

        let mut register_ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_read as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_read, &mut register_ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(tickle_read);
                libc::close(tickle_write);
            }
            return Err(RuntimeError::EpollCreate(err));
        }

        let manager = Arc::new(IoManager {
            scheduler: scheduler.clone(),
            timers: TimerManager::new(),
            epoll_fd,
            tickle_read,
            tickle_write,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
        });

        scheduler.set_hooks(manager.clone() as Arc<dyn SchedulerHooks>);
        registry().write().unwrap().replace(Arc::downgrade(&manager));

        Ok(manager)
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.scheduler.start()
    }

    pub fn stop(self: &Arc<Self>) {
        self.scheduler.stop();
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn add_timer<F>(&self, period_ms: u64, callback: F, cyclic: bool) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers.add_timer(period_ms, callback, cyclic)
    }

    pub fn add_condition_timer<F>(&self, period_ms: u64, callback: F, condition: Weak<()>, cyclic: bool) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers.add_condition_timer(period_ms, callback, condition, cyclic)
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let contexts = self.fd_contexts.read().unwrap();
            if let Some(Some(ctx)) = contexts.get(idx) {
                return ctx.clone();
            }
        }
        let mut contexts = self.fd_contexts.write().unwrap();
        if contexts.len() <= idx {
            let new_len = (contexts.len().max(32) * 2).max(idx + 1);
            contexts.resize_with(new_len, || None);
        }
        if contexts[idx].is_none() {
            contexts[idx] = Some(Arc::new(FdContext {
                slot: Mutex::new(FdSlot {
                    interest: 0,
                    read: None,
                    write: None,
                }),
            }));
        }
        contexts[idx].as_ref().unwrap().clone()
    }

    fn epoll_reprogram(&self, fd: RawFd, old_interest: Event, new_interest: Event) {
        let op = if old_interest == 0 && new_interest != 0 {
            libc::EPOLL_CTL_ADD
        } else if new_interest == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: epoll_bits_for(new_interest),
            u64: fd as u64,
        };
        let ev_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut _
        };
        unsafe {
            libc::epoll_ctl(self.epoll_fd, op, fd, ev_ptr);
        }
    }

    /// Registers interest in `event` on `fd`. `callback`, if given, replaces
    /// "resubmit the calling coroutine" with a raw callable; otherwise the
    /// currently-running coroutine (per `environment::current_task_handle`)
    /// is captured. Contract violation (debug-asserted) to double-register
    /// the same direction without an intervening removal.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Box<dyn FnOnce() + Send>>) {
        assert!(event == READ || event == WRITE, "contract violation: add_event takes exactly one direction");
        let ctx = self.fd_context(fd);
        let mut slot = ctx.slot.lock().unwrap();
        assert!(slot.interest & event == 0, "contract violation: fd {} already has event {:?} registered", fd, event);

        let handler = match callback {
            Some(cb) => EventHandler::Callback(cb),
            None => {
                let task = environment::current_task_handle()
                    .expect("contract violation: add_event with no callback requires a running coroutine");
                EventHandler::Fiber(task, Affinity::Any)
            }
        };
        if event & READ != 0 {
            slot.read = Some(handler);
        } else {
            slot.write = Some(handler);
        }

        let old_interest = slot.interest;
        let new_interest = old_interest | event;
        self.epoll_reprogram(fd, old_interest, new_interest);
        slot.interest = new_interest;
        self.pending_events.fetch_add(1, Ordering::SeqCst);
    }

    /// Clears the handler for `event` on `fd` without firing it.
    pub fn remove_event(&self, fd: RawFd, event: Event) {
        let ctx = self.fd_context(fd);
        let mut slot = ctx.slot.lock().unwrap();
        let had = if event & READ != 0 {
            slot.read.take().is_some()
        } else {
            slot.write.take().is_some()
        };
        let old_interest = slot.interest;
        let new_interest = old_interest & !event;
        self.epoll_reprogram(fd, old_interest, new_interest);
        slot.interest = new_interest;
        drop(slot);
        if had {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Like `remove_event`, but fires the handler once first, as if the
    /// event had become ready.
    pub fn cancel_event(&self, fd: RawFd, event: Event) {
        let ctx = self.fd_context(fd);
        let handler = {
            let mut slot = ctx.slot.lock().unwrap();
            let taken = if event & READ != 0 {
                slot.read.take()
            } else {
                slot.write.take()
            };
            let old_interest = slot.interest;
            let new_interest = old_interest & !event;
            self.epoll_reprogram(fd, old_interest, new_interest);
            slot.interest = new_interest;
            if old_interest & event != 0 {
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            taken
        };
        if let Some(handler) = handler {
            handler.fire(&self.scheduler);
        }
    }

    /// Fires any registered READ then WRITE handler on `fd` and removes it
    /// from epoll entirely. Used by the `close` hook.
    pub fn cancel_all(&self, fd: RawFd) {
        let ctx = self.fd_context(fd);
        let (read_handler, write_handler) = {
            let mut slot = ctx.slot.lock().unwrap();
            let old_interest = slot.interest;
            if old_interest != 0 {
                unsafe {
                    libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
            }
            let r = slot.read.take();
            let w = slot.write.take();
            if old_interest & READ != 0 {
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            if old_interest & WRITE != 0 {
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            slot.interest = 0;
            (r, w)
        };
        if let Some(h) = read_handler {
            h.fire(&self.scheduler);
        }
        if let Some(h) = write_handler {
            h.fire(&self.scheduler);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.tickle_read, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_read);
            libc::close(self.tickle_write);
        }
    }
}

fn epoll_bits_for(interest: Event) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    if interest & READ != 0 {
        bits |= libc::EPOLLIN as u32;
    }
    if interest & WRITE != 0 {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl SchedulerHooks for IoManager {
    /// Writes a single byte to the tickle pipe, but only if a worker is
    /// actually parked in epoll_wait; otherwise there's nothing to wake.
    fn tickle(&self) {
        if self.scheduler.has_idle_thread() {
            let byte = [1u8];
            unsafe {
                libc::write(self.tickle_write, byte.as_ptr() as *const _, 1);
            }
        }
    }

    fn on_stop(&self, scheduler: &Scheduler) -> bool {
        scheduler.is_stopped() && self.pending_events.load(Ordering::SeqCst) == 0 && !self.timers.has_timer()
    }

    fn on_idle(&self, scheduler: &Scheduler) {
        loop {
            let next_timeout = self.timers.next_timeout_ms();
            if self.on_stop(scheduler) && next_timeout.is_none() {
                break;
            }

            let wait_ms = match next_timeout {
                Some(ms) => ms.min(MAX_WAIT_MS as u64) as i32,
                None => MAX_WAIT_MS,
            };

            let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS] = unsafe { std::mem::zeroed() };
            let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EPOLL_EVENTS as i32, wait_ms) };

            let mut expired = Vec::new();
            self.timers.drain_expired(&mut expired);
            if !expired.is_empty() {
                let tasks: Vec<Task> = expired
                    .into_iter()
                    .map(|cb| Task::from_callback(cb, Affinity::Any))
                    .collect();
                self.scheduler.schedule_bulk(tasks);
            }

            if n > 0 {
                for ev in &events[..n as usize] {
                    let fd = ev.u64 as RawFd;
                    if fd == self.tickle_read {
                        self.drain_tickle_pipe();
                        continue;
                    }

                    let raw = ev.events;
                    let hup_or_err = raw & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
                    let mut real_mask: Event = 0;
                    if hup_or_err || raw & libc::EPOLLIN as u32 != 0 {
                        real_mask |= READ;
                    }
                    if hup_or_err || raw & libc::EPOLLOUT as u32 != 0 {
                        real_mask |= WRITE;
                    }

                    let ctx = self.fd_context(fd);
                    let (fire_read, fire_write) = {
                        let mut slot = ctx.slot.lock().unwrap();
                        let effective = real_mask & slot.interest;
                        if effective == 0 {
                            (None, None)
                        } else {
                            let old_interest = slot.interest;
                            let new_interest = old_interest & !effective;
                            self.epoll_reprogram(fd, old_interest, new_interest);
                            slot.interest = new_interest;
                            let fr = if effective & READ != 0 { slot.read.take() } else { None };
                            let fw = if effective & WRITE != 0 { slot.write.take() } else { None };
                            if fr.is_some() {
                                self.pending_events.fetch_sub(1, Ordering::SeqCst);
                            }
                            if fw.is_some() {
                                self.pending_events.fetch_sub(1, Ordering::SeqCst);
                            }
                            (fr, fw)
                        }
                    };
                    // READ before WRITE, per SPEC_FULL.md §5's ordering guarantee.
                    if let Some(h) = fire_read {
                        h.fire(&self.scheduler);
                    }
                    if let Some(h) = fire_write {
                        h.fire(&self.scheduler);
                    }
                }
            }

            fiber::yield_to_hold();

            if self.on_stop(scheduler) {
                break;
            }
        }
    }
}

static CURRENT: OnceLock<RwLock<Option<Weak<IoManager>>>> = OnceLock::new();

fn registry() -> &'static RwLock<Option<Weak<IoManager>>> {
    CURRENT.get_or_init(|| RwLock::new(None))
}

/// The most recently constructed `IoManager`, if it's still alive. Hooks use
/// this to find the reactor to register interest with. A process-wide slot
/// (rather than a thread-local, as the coroutine/scheduler anchors use) is
/// the right shape here: a program embeds at most one reactor in practice,
/// and every hooked thread needs to reach it, not just the thread that built it.
pub fn current() -> Option<Arc<IoManager>> {
    registry().read().unwrap().as_ref().and_then(Weak::upgrade)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[test]
    fn add_event_fires_callback_on_readability() {
        let _ = env_logger::builder().is_test(true).try_init();
        let manager = IoManager::new(2, false, "io-test").unwrap();
        manager.start().unwrap();

        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        manager.add_event(
            fd,
            READ,
            Some(Box::new(move || {
                fired2.store(true, Ordering::SeqCst);
            })),
        );

        std::io::Write::write_all(&mut a, b"x").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        manager.stop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_all_fires_both_registered_handlers_once() {
        let manager = IoManager::new(1, false, "io-cancel-test").unwrap();
        manager.start().unwrap();

        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let read_fired = Arc::new(AtomicUsize::new(0));
        let write_fired = Arc::new(AtomicUsize::new(0));
        let (r2, w2) = (read_fired.clone(), write_fired.clone());
        manager.add_event(fd, READ, Some(Box::new(move || { r2.fetch_add(1, Ordering::SeqCst); })));
        manager.add_event(fd, WRITE, Some(Box::new(move || { w2.fetch_add(1, Ordering::SeqCst); })));

        manager.cancel_all(fd);
        std::thread::sleep(Duration::from_millis(50));
        manager.stop();

        assert_eq!(read_fired.load(Ordering::SeqCst), 1);
        assert_eq!(write_fired.load(Ordering::SeqCst), 1);
    }
}
