// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! M:N stackful coroutines, a dispatch scheduler, an epoll reactor with a
//! timer wheel, and a syscall interception layer that turns blocking POSIX
//! I/O into cooperative suspensions.
//!
//! A minimal echo server looks like:
//!
//! ```no_run
//! let io = hxk_runtime::IoManager::new(4, true, "io").unwrap();
//! io.start().unwrap();
//! io.scheduler().schedule(|| {
//!     // hooked_runtime::hooks::read/write/accept/... park the calling
//!     // coroutine on the reactor instead of blocking the worker thread.
//! });
//! io.stop();
//! ```

mod config;
mod environment;
mod error;
mod fd_manager;
mod fiber;
mod hooks;
mod io_manager;
mod scheduler;
mod stack;
mod timer;

pub use config::{ConfigVar, FIBER_STACK_SIZE, TCP_CONNECT_TIMEOUT_MS};
pub use error::{Result, RuntimeError};
pub use fiber::{back, yield_to_hold, yield_to_ready, Handle as CoroutineHandle, State as CoroutineState};
pub use io_manager::{current as current_io_manager, Event, IoManager, READ, WRITE};
pub use scheduler::{Affinity, Scheduler, SchedulerHooks};
pub use timer::{TimerHandle, TimerManager};

/// The syscall interception layer: transparent hooks for the blocking POSIX
/// calls a coroutine running under a scheduler's dispatch loop issues.
/// Disabled by default on any thread that isn't a dispatch-loop worker;
/// enable manually on a user-created thread with
/// [`enable_hooks_on_this_thread`] if it must also park cooperatively.
pub mod hook {
    pub use crate::hooks::{
        accept, close, connect, fcntl, init as init_hooks, ioctl, nanosleep, read, readv, recv, send, setsockopt, sleep, socket,
        usleep, write, writev,
    };
}

/// Spawns a new coroutine with the default stack size, returning a handle
/// that must be submitted to a [`Scheduler`] (or run directly via
/// [`CoroutineHandle::swap_in`]) to make progress.
pub fn spawn<F>(callback: F) -> Result<CoroutineHandle>
where
    F: FnOnce() + Send + 'static,
{
    CoroutineHandle::spawn(callback, 0, None)
}

/// Returns the number of coroutine stacks currently allocated in this
/// process.
pub fn live_coroutine_count() -> i64 {
    stack::live_fiber_count()
}

/// Enables the syscall hooks on the calling thread. The scheduler's dispatch
/// loop does this for every worker automatically; call this yourself only if
/// a thread you created outside a [`Scheduler`] also needs hooked I/O to
/// cooperate with a running reactor.
pub fn enable_hooks_on_this_thread() {
    environment::set_hooks_enabled(true);
}

pub fn hooks_enabled_on_this_thread() -> bool {
    environment::hooks_enabled()
}
