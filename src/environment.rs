//! Per-OS-thread anchors.
//!
//! Generalizes the teacher's `Environment` (current fiber + bootstrap fiber +
//! stack pool) with the extra anchors SPEC_FULL.md's "Thread-local anchors"
//! section names: a pointer to the current scheduler, a pointer to the
//! scheduler's dispatch coroutine, and a "hooks enabled" flag. Grounded
//! additionally on `original_source/code/fiber/scheduler.cpp`'s
//! `t_scheduler`/`t_scheduler_fiber` thread-locals and `hook.cpp`'s
//! per-thread hooks-enabled flag.

use std::cell::{Cell, RefCell};

use crate::fiber::{Fiber, Handle};
use crate::stack::StackPool;

struct Environment {
    stack_pool: StackPool,
    current_fiber: *mut Fiber,
    bootstrap_fiber: Option<Handle>,
    current_scheduler: *mut (),
    dispatch_fiber: *mut Fiber,
    current_task_handle: Option<Handle>,
}

impl Environment {
    fn new() -> Environment {
        Environment {
            stack_pool: StackPool::new(),
            current_fiber: std::ptr::null_mut(),
            bootstrap_fiber: None,
            current_scheduler: std::ptr::null_mut(),
            dispatch_fiber: std::ptr::null_mut(),
            current_task_handle: None,
        }
    }
}

thread_local! {
    static ENV: RefCell<Environment> = RefCell::new(Environment::new());
    static HOOKS_ENABLED: Cell<bool> = Cell::new(false);
}

/// Returns a raw pointer to the currently-executing fiber on this thread, or
/// null if none has been entered yet (the thread is running its own native
/// stack, outside any fiber).
pub fn current_fiber_ptr() -> *mut Fiber {
    ENV.with(|env| env.borrow().current_fiber)
}

pub fn set_current_fiber_ptr(ptr: *mut Fiber) {
    ENV.with(|env| env.borrow_mut().current_fiber = ptr);
}

/// Returns the thread's bootstrap fiber, lazily creating it on first query.
/// The bootstrap fiber owns no stack and represents the thread's own native
/// execution context; per SPEC_FULL.md §3 it must be in the `Exec` state.
pub fn bootstrap_fiber_ptr() -> *mut Fiber {
    ENV.with(|env| {
        let mut env = env.borrow_mut();
        if env.bootstrap_fiber.is_none() {
            env.bootstrap_fiber = Some(Handle::new(Fiber::new_bootstrap()));
        }
        env.bootstrap_fiber.as_ref().unwrap().get_mut() as *mut Fiber
    })
}

pub fn current_scheduler_ptr() -> *mut () {
    ENV.with(|env| env.borrow().current_scheduler)
}

pub fn set_current_scheduler_ptr(ptr: *mut ()) {
    ENV.with(|env| env.borrow_mut().current_scheduler = ptr);
}

pub fn dispatch_fiber_ptr() -> *mut Fiber {
    ENV.with(|env| env.borrow().dispatch_fiber)
}

pub fn set_dispatch_fiber_ptr(ptr: *mut Fiber) {
    ENV.with(|env| env.borrow_mut().dispatch_fiber = ptr);
}

pub fn hooks_enabled() -> bool {
    HOOKS_ENABLED.with(|f| f.get())
}

pub fn set_hooks_enabled(enabled: bool) {
    HOOKS_ENABLED.with(|f| f.set(enabled));
}

pub fn with_stack_pool<R>(f: impl FnOnce(&mut StackPool) -> R) -> R {
    ENV.with(|env| f(&mut env.borrow_mut().stack_pool))
}

/// The `Handle` of the fiber the dispatch loop is currently running on this
/// thread, if any. Set by the scheduler right before `swap_in`; hooks use
/// this to obtain a strong reference to "the calling coroutine" to register
/// with the I/O manager or timer manager without the hook itself needing to
/// carry one through.
pub fn current_task_handle() -> Option<Handle> {
    ENV.with(|env| env.borrow().current_task_handle.clone())
}

pub fn set_current_task_handle(handle: Option<Handle>) {
    ENV.with(|env| env.borrow_mut().current_task_handle = handle);
}
