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

//! The dispatch scheduler.
//!
//! Grounded on the teacher's `src/scheduler.rs` for the Rust shape of thread
//! pool bring-up and a panic-catching resume path, but the queue itself is
//! new: the teacher's Chase-Lev work-stealing deque is dropped (work-stealing
//! across threads is explicitly out of scope, SPEC_FULL.md §1) in favor of a
//! single `Mutex<VecDeque<Task>>`, FIFO, exactly as `original_source/code/fiber/scheduler.cpp`
//! schedules. The dispatch loop's task-scan-with-affinity-skip, idle
//! coroutine, and `use_caller` root-thread wiring are grounded on that same
//! file's `Scheduler::run()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::environment;
use crate::error::{Result, RuntimeError};
use crate::fiber::{self, Handle, State};

/// Which worker thread a task is allowed to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Any,
    Thread(ThreadId),
}

/// A unit of work: either a fiber parked mid-flight, or a fresh callback that
/// still needs a fiber built for it.
pub struct Task {
    fiber: Option<Handle>,
    callback: Option<Box<dyn FnOnce() + Send>>,
    affinity: Affinity,
}

impl Task {
    pub fn from_callback<F>(f: F, affinity: Affinity) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            fiber: None,
            callback: Some(Box::new(f)),
            affinity,
        }
    }

    pub fn from_fiber(fiber: Handle, affinity: Affinity) -> Task {
        Task {
            fiber: Some(fiber),
            callback: None,
            affinity,
        }
    }
}

/// Overridable dispatch-loop behavior. The I/O manager implements this to
/// fuse epoll + timer waiting into the scheduler's idle path
/// (SPEC_FULL.md §4.2/§4.4); a bare `Scheduler` uses `DefaultHooks`.
pub trait SchedulerHooks: Send + Sync {
    /// Wakes one blocked worker thread. The default scheduler has nothing to
    /// wake (`on_idle` just spins on yield), so this is a no-op; the I/O
    /// manager overrides it to write to the tickle pipe.
    fn tickle(&self);

    /// Called once the scheduler believes it is fully stopped, to decide
    /// whether shutdown may actually proceed (the I/O manager delays this
    /// until its epoll fd and tickle pipe are torn down).
    fn on_stop(&self, scheduler: &Scheduler) -> bool {
        scheduler.is_stopped()
    }

    /// Runs the idle coroutine's body. Must periodically `yield_to_hold()`
    /// and must return once `scheduler.is_stopped()` holds, so the dispatch
    /// loop can notice there is nothing left to do and exit.
    fn on_idle(&self, scheduler: &Scheduler) {
        while !scheduler.is_stopped() {
            fiber::yield_to_hold();
        }
    }
}

struct DefaultHooks;

impl SchedulerHooks for DefaultHooks {
    fn tickle(&self) {
        log::trace!("tickle (default hooks: no wakeable waiter)");
    }
}

/// A pool of worker threads draining a single FIFO task queue.
pub struct Scheduler {
    name: String,
    task_list: Mutex<VecDeque<Task>>,
    active_count: AtomicUsize,
    idle_thread_count: AtomicUsize,
    stopped: AtomicBool,
    auto_stopped: AtomicBool,
    worker_count: usize,
    use_caller: bool,
    root_thread_id: Mutex<Option<ThreadId>>,
    root_fiber: Mutex<Option<Handle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    hooks: Mutex<Arc<dyn SchedulerHooks>>,
}

impl Scheduler {
    /// Builds a scheduler with `worker_count` total participating threads.
    /// When `use_caller` is set, one of those threads is the thread that
    /// calls `start()`/`stop()` itself (the teacher's "hold the caller"
    /// mode) rather than a spawned one.
    pub fn new(worker_count: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        assert!(worker_count > 0, "contract violation: scheduler needs at least one worker thread");
        let spawned_workers = if use_caller { worker_count - 1 } else { worker_count };
        Arc::new(Scheduler {
            name: name.into(),
            task_list: Mutex::new(VecDeque::new()),
            active_count: AtomicUsize::new(0),
            idle_thread_count: AtomicUsize::new(0),
            stopped: AtomicBool::new(true),
            auto_stopped: AtomicBool::new(false),
            worker_count: spawned_workers,
            use_caller,
            root_thread_id: Mutex::new(None),
            root_fiber: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            hooks: Mutex::new(Arc::new(DefaultHooks)),
        })
    }

    /// Installs a `SchedulerHooks` override. Must be called before `start()`;
    /// the I/O manager does this immediately after constructing itself.
    pub fn set_hooks(&self, hooks: Arc<dyn SchedulerHooks>) {
        *self.hooks.lock().unwrap() = hooks;
    }

    fn hooks(&self) -> Arc<dyn SchedulerHooks> {
        self.hooks.lock().unwrap().clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once shutdown has been requested and there is no remaining work:
    /// an empty queue and no fiber currently `Exec`.
    pub fn is_stopped(&self) -> bool {
        self.auto_stopped.load(Ordering::SeqCst)
            && self.task_list.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    pub fn has_idle_thread(&self) -> bool {
        self.idle_thread_count.load(Ordering::SeqCst) > 0
    }

    fn schedule_task(&self, task: Task, instant: bool) {
        let was_empty = {
            let mut list = self.task_list.lock().unwrap();
            let was_empty = list.is_empty();
            if instant {
                list.push_front(task);
            } else {
                list.push_back(task);
            }
            was_empty
        };
        if was_empty {
            self.hooks().tickle();
        }
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::from_callback(f, Affinity::Any), false);
    }

    pub fn schedule_with_affinity<F>(&self, f: F, affinity: Affinity)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::from_callback(f, affinity), false);
    }

    /// Bulk-enqueues tasks built elsewhere, tickling at most once.
    pub fn schedule_bulk(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let was_empty = {
            let mut list = self.task_list.lock().unwrap();
            let was_empty = list.is_empty();
            list.extend(tasks);
            was_empty
        };
        if was_empty {
            self.hooks().tickle();
        }
    }

    /// Re-enqueues a fiber that yielded `Ready`, at the back, preserving its
    /// affinity. Called only by the dispatch loop.
    fn reschedule_fiber(&self, fiber: Handle, affinity: Affinity) {
        self.schedule_task(Task::from_fiber(fiber, affinity), false);
    }

    /// Pushes a fiber to the front of the queue for immediate attention
    /// (used by the I/O manager and timer manager when an event fires).
    pub fn schedule_instant(&self, fiber: Handle, affinity: Affinity) {
        self.schedule_task(Task::from_fiber(fiber, affinity), true);
    }

    /// Spawns the worker threads and, in `use_caller` mode, prepares the root
    /// fiber that `stop()` will later drive from the calling thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if self.use_caller {
            *self.root_thread_id.lock().unwrap() = Some(thread::current().id());
            let sched = self.clone();
            let name = self.name.clone();
            let fiber = Handle::spawn(move || sched.dispatch_loop(), 0, Some(format!("{}-root", name)))?;
            *self.root_fiber.lock().unwrap() = Some(fiber);
        }

        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "contract violation: start() called twice");
        for i in 0..self.worker_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || sched.dispatch_loop())
                .map_err(RuntimeError::ThreadSpawn)?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Requests shutdown: no further tasks are accepted as "keep running"
    /// work, wakes every worker so it notices, and (in `use_caller` mode)
    /// drives the root fiber itself until there is nothing left.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stopped.store(true, Ordering::SeqCst);

        for _ in 0..self.worker_count {
            self.hooks().tickle();
        }

        if self.use_caller {
            self.hooks().tickle();
            let root_fiber = self.root_fiber.lock().unwrap().clone();
            if let Some(fiber) = root_fiber {
                if !fiber.is_finished() {
                    fiber.call();
                }
            }
        }

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        self.stopped.store(true, Ordering::SeqCst);
        self.hooks().on_stop(self);
    }

    /// The body every worker thread (and, in `use_caller` mode, the root
    /// fiber) runs: repeatedly pop an eligible task, run it to its next
    /// suspension point, and fall back to the idle coroutine when the queue
    /// has nothing this thread is allowed to touch.
    fn dispatch_loop(self: Arc<Self>) {
        environment::set_current_scheduler_ptr(Arc::as_ptr(&self) as *mut ());
        environment::set_hooks_enabled(true);

        let this_thread = thread::current().id();
        let hooks = self.hooks();

        let idle_sched = self.clone();
        let idle_hooks = hooks.clone();
        let idle_fiber = Handle::spawn(move || idle_hooks.on_idle(&idle_sched), 0, Some("<idle>".to_string()))
            .expect("failed to allocate idle fiber stack");
        environment::set_dispatch_fiber_ptr(idle_fiber.get_mut() as *mut fiber::Fiber);

        loop {
            if self.is_stopped() {
                break;
            }

            let mut needs_tickle = false;
            let picked = {
                let mut list = self.task_list.lock().unwrap();
                let mut found = None;
                for idx in 0..list.len() {
                    let eligible = match list[idx].affinity {
                        Affinity::Any => true,
                        Affinity::Thread(id) => id == this_thread,
                    };
                    if !eligible {
                        needs_tickle = true;
                        continue;
                    }
                    if let Some(fiber) = &list[idx].fiber {
                        if fiber.state() == State::Exec {
                            continue;
                        }
                    }
                    found = Some(idx);
                    break;
                }
                found.map(|idx| list.remove(idx).unwrap())
            };

            if needs_tickle {
                hooks.tickle();
            }

            match picked {
                Some(mut task) => {
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    let affinity = task.affinity;
                    let fiber = match task.fiber.take() {
                        Some(f) => f,
                        None => {
                            let callback = task.callback.take().unwrap();
                            match Handle::spawn(callback, 0, None) {
                                Ok(f) => f,
                                Err(e) => {
                                    log::error!("failed to build task fiber: {}", e);
                                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                                    continue;
                                }
                            }
                        }
                    };

                    environment::set_current_task_handle(Some(fiber.clone()));
                    fiber.swap_in();
                    environment::set_current_task_handle(None);
                    self.active_count.fetch_sub(1, Ordering::SeqCst);

                    match fiber.state() {
                        State::Ready => self.reschedule_fiber(fiber, affinity),
                        State::Term => {}
                        State::Exception => {
                            if let Some(panic) = fiber.take_panic() {
                                log::error!("task fiber panicked: {}", fiber::panic_message_public(&panic));
                            }
                        }
                        State::Hold => {
                            // Parked: whoever put it here (a timer or an FD
                            // event handler) must already hold its own
                            // `Handle` clone, or this fiber is never resumed.
                            // Dropping our clone here is correct, not a leak.
                        }
                        State::Init | State::Exec => {
                            unreachable!("swap_in() never returns in these states")
                        }
                    }
                }
                None => {
                    if idle_fiber.is_finished() {
                        break;
                    }
                    self.idle_thread_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle_thread_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        log::debug!("scheduler '{}' dispatch loop on {:?} exiting", self.name, this_thread);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn scheduler_drains_many_callbacks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sched = Scheduler::new(4, false, "test");
        sched.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1024 {
            let counter = counter.clone();
            sched.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        std::thread::sleep(Duration::from_millis(200));
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1024);
    }

    #[test]
    fn yielding_fiber_is_rescheduled_until_it_finishes() {
        let sched = Scheduler::new(1, false, "test-yield");
        sched.start().unwrap();

        let trace = Arc::new(Mutex::new(Vec::new()));
        let trace2 = trace.clone();
        sched.schedule(move || {
            for i in 0..3 {
                trace2.lock().unwrap().push(i);
                fiber::yield_to_ready();
            }
        });

        std::thread::sleep(Duration::from_millis(100));
        sched.stop();
        assert_eq!(*trace.lock().unwrap(), vec![0, 1, 2]);
    }
}
