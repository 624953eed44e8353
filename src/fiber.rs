//! The stackful coroutine primitive.
//!
//! Grounded on the teacher's `src/coroutine_unique.rs` (`State`, `Handle`,
//! `Coroutine`, the `coroutine_initialize` trampoline) for the Rust
//! ownership idiom, and on `original_source/code/fiber/fiber.cpp`/`fiber.h`
//! for the exact state machine and operation names the distilled spec
//! describes (`swapIn`/`swapOut`/`call`/`back`, the master/bootstrap fiber,
//! `use_caller` mode).

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use context::{Context, Transfer};

use crate::config::FIBER_STACK_SIZE;
use crate::environment;
use crate::error::Result;
use crate::stack::{fiber_count_dec, fiber_count_inc, next_fiber_id, Stack};

/// Execution state of a fiber, per SPEC_FULL.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Hold,
    Exec,
    Term,
    Exception,
}

/// The payload carried back to the resumer when a fiber runs to completion
/// (successfully or via panic).
pub type FiberOutcome = std::result::Result<(), Box<dyn Any + Send>>;

type Entry = Box<dyn FnOnce() + Send>;

struct EntryPayload {
    callback: Entry,
}

thread_local! {
    /// The context to resume when the currently-running fiber yields. Updated
    /// on every transfer in or out of a fiber on this thread; this is what
    /// lets `yield_to_hold`/`yield_to_ready`, called arbitrarily deep inside
    /// user code, swap back to whoever most recently resumed this thread's
    /// current fiber.
    static YIELD_CONTEXT: RefCell<Option<Context>> = RefCell::new(None);
}

/// A stackful coroutine.
pub struct Fiber {
    id: u64,
    state: State,
    name: Option<String>,
    stack: Option<Stack>,
    context: Option<Context>,
    entry: Option<Entry>,
    panic: Option<Box<dyn Any + Send>>,
}

impl Fiber {
    /// Builds the thread's bootstrap fiber: no stack, no context, already
    /// `Exec`. It is never resumed into; it exists purely so "current fiber"
    /// always resolves to something.
    pub(crate) fn new_bootstrap() -> Fiber {
        Fiber {
            id: next_fiber_id(),
            state: State::Exec,
            name: Some("<bootstrap>".to_string()),
            stack: None,
            context: None,
            entry: None,
            panic: None,
        }
    }

    /// Constructs a new fiber with the given entry point. `stack_size == 0`
    /// means "use the configured default" (`fiber.stack_size`).
    pub fn new<F>(callback: F, stack_size: usize, name: Option<String>) -> Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 { FIBER_STACK_SIZE.get() } else { stack_size };
        let stack = environment::with_stack_pool(|pool| pool.take_stack(size))?;
        let context = Context::new(stack.context_stack(), fiber_trampoline);
        fiber_count_inc();
        Ok(Fiber {
            id: next_fiber_id(),
            state: State::Init,
            name,
            stack: Some(stack),
            context: Some(context),
            entry: Some(Box::new(callback)),
            panic: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this fiber has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Term | State::Exception)
    }

    /// The panic payload captured by the entry trampoline, if the fiber
    /// ended in `Exception`.
    pub fn take_panic(&mut self) -> Option<Box<dyn Any + Send>> {
        self.panic.take()
    }

    /// Resets a terminal or not-yet-started fiber to run a new entry point.
    /// Legal only from {Init, Term, Exception}, per SPEC_FULL.md §3.
    pub fn reset<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            matches!(self.state, State::Init | State::Term | State::Exception),
            "contract violation: reset() called on a fiber in state {:?}",
            self.state
        );
        assert!(self.stack.is_some(), "contract violation: reset() on a stackless fiber");
        let stack_ref = self.stack.as_ref().unwrap();
        self.context = Some(Context::new(stack_ref.context_stack(), fiber_trampoline));
        self.entry = Some(Box::new(callback));
        self.panic = None;
        self.state = State::Init;
        Ok(())
    }

    /// Enters this fiber, running it until it yields or terminates.
    ///
    /// Requires state in {Init, Ready, Hold}; sets state `Exec` for the
    /// duration, and leaves it as whatever the fiber last assigned to itself
    /// before yielding (or `Term`/`Exception` on completion).
    pub fn swap_in(&mut self) {
        assert!(
            matches!(self.state, State::Init | State::Ready | State::Hold),
            "contract violation: swap_in() requires INIT/READY/HOLD, found {:?}",
            self.state
        );
        assert!(self.stack.is_some(), "contract violation: swap_in() on the bootstrap fiber");

        self.state = State::Exec;

        let previous_fiber = environment::current_fiber_ptr();
        environment::set_current_fiber_ptr(self as *mut Fiber);

        let data = match self.entry.take() {
            Some(callback) => Box::into_raw(Box::new(EntryPayload { callback })) as usize,
            None => 0,
        };

        let ctx = self.context.take().expect("contract violation: swap_in() on a finished fiber");
        let transfer = ctx.resume(data);
        self.context = Some(transfer.context);

        if transfer.data != 0 {
            let outcome = *unsafe { Box::from_raw(transfer.data as *mut FiberOutcome) };
            match outcome {
                Ok(()) => self.state = State::Term,
                Err(payload) => {
                    self.state = State::Exception;
                    self.panic = Some(payload);
                }
            }
        }

        environment::set_current_fiber_ptr(previous_fiber);
    }

    /// Enters this fiber when hosted on the caller's own thread (the
    /// "use_caller" scheduler mode): mechanically identical to `swap_in`,
    /// since which context gets resumed is determined by whoever is
    /// currently latched into `YIELD_CONTEXT`, not by a separate code path.
    pub fn call(&mut self) {
        self.swap_in();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            fiber_count_dec();
            environment::with_stack_pool(|pool| pool.give_stack(stack));
        }
    }
}

/// A cloneable handle to a fiber.
///
/// Exactly one clone is ever "in motion" through a context switch at a time;
/// that invariant comes from the scheduler's locking discipline (SPEC_FULL.md
/// §5), not from Rust's aliasing rules, so the shared mutable access below is
/// unchecked. This is the same shape as the teacher's `Handle(Unique<Coroutine>)`,
/// generalized from an owning unique pointer to a reference-counted one: a
/// parked fiber's registered FD or timer handler needs its own strong
/// reference so it can resume the fiber later without racing the scheduler's
/// own bookkeeping (SPEC_FULL.md §9, "cyclic ownership").
pub struct Handle(Arc<UnsafeCell<Fiber>>);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Clone for Handle {
    fn clone(&self) -> Handle {
        Handle(self.0.clone())
    }
}

impl Handle {
    pub fn new(fiber: Fiber) -> Handle {
        Handle(Arc::new(UnsafeCell::new(fiber)))
    }

    pub fn spawn<F>(callback: F, stack_size: usize, name: Option<String>) -> Result<Handle>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Handle::new(Fiber::new(callback, stack_size, name)?))
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut Fiber {
        unsafe { &mut *self.0.get() }
    }

    pub fn id(&self) -> u64 {
        self.get_mut().id()
    }

    pub fn state(&self) -> State {
        self.get_mut().state()
    }

    pub fn name(&self) -> Option<&str> {
        self.get_mut().name()
    }

    pub fn is_finished(&self) -> bool {
        self.get_mut().is_finished()
    }

    pub fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.get_mut().take_panic()
    }

    pub fn swap_in(&self) {
        self.get_mut().swap_in();
    }

    pub fn call(&self) {
        self.get_mut().call();
    }

    pub fn reset<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.get_mut().reset(callback)
    }
}

/// Suspends the thread back to whoever last resumed the current fiber.
/// Panics if called outside of a running fiber.
fn swap_out(result_data: usize) -> usize {
    YIELD_CONTEXT.with(|cell| {
        let ctx = cell
            .borrow_mut()
            .take()
            .expect("contract violation: yield called outside of a running fiber");
        let transfer = ctx.resume(result_data);
        *cell.borrow_mut() = Some(transfer.context);
        transfer.data
    })
}

/// Yields the current fiber, marking it `Ready` so the scheduler re-enqueues
/// it immediately at the back of the task queue.
pub fn yield_to_ready() {
    set_current_fiber_state(State::Ready);
    swap_out(0);
}

/// Yields the current fiber, marking it `Hold`: it is not re-enqueued and
/// will only run again via an explicit `schedule`, a fired I/O event, or a
/// fired timer.
pub fn yield_to_hold() {
    set_current_fiber_state(State::Hold);
    swap_out(0);
}

/// The `use_caller`-mode counterpart to `Handle::call`: returns control to
/// whoever entered the current fiber via `call` (the thread's bootstrap
/// fiber, in that mode) rather than to a dedicated worker's dispatch
/// coroutine. Mechanically identical to `yield_to_hold` — `YIELD_CONTEXT`
/// already resumes whoever last resumed the current fiber, so which
/// context that happens to be is a property of how the fiber was entered,
/// not of a separate transfer path.
pub fn back() {
    yield_to_hold();
}

fn set_current_fiber_state(state: State) {
    let ptr = environment::current_fiber_ptr();
    assert!(!ptr.is_null(), "contract violation: yield called with no current fiber");
    unsafe {
        (*ptr).state = state;
    }
}

/// Returns a raw pointer to the fiber currently executing on this thread,
/// lazily creating the thread's bootstrap fiber if none has been entered.
pub fn current() -> *mut Fiber {
    let ptr = environment::current_fiber_ptr();
    if ptr.is_null() {
        let bootstrap = environment::bootstrap_fiber_ptr();
        environment::set_current_fiber_ptr(bootstrap);
        bootstrap
    } else {
        ptr
    }
}

extern "C" fn fiber_trampoline(t: Transfer) -> ! {
    YIELD_CONTEXT.with(|cell| *cell.borrow_mut() = Some(t.context));

    let payload = unsafe { Box::from_raw(t.data as *mut EntryPayload) };
    let callback = payload.callback;

    let result: FiberOutcome = panic::catch_unwind(AssertUnwindSafe(callback));
    if let Err(ref payload) = result {
        log::error!("fiber terminated with a panic: {:?}", panic_message(payload));
    }

    let outcome_ptr = Box::into_raw(Box::new(result)) as usize;
    swap_out(outcome_ptr);

    // Contract violation: a terminal fiber was resumed again. Loop
    // defensively rather than executing past the end of a dead stack.
    loop {
        swap_out(0);
    }
}

/// Renders a captured panic payload for logging at the call site that
/// observes a fiber's `Exception` state (the scheduler's dispatch loop).
pub fn panic_message_public(payload: &Box<dyn Any + Send>) -> &str {
    panic_message(payload)
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<Any>"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fiber_runs_to_completion() {
        let flag = Arc::new(AtomicUsize::new(0));
        let flag2 = flag.clone();
        let mut fiber = Fiber::new(
            move || {
                flag2.store(1, Ordering::SeqCst);
            },
            64 * 1024,
            None,
        )
        .unwrap();
        assert_eq!(fiber.state(), State::Init);
        fiber.swap_in();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fiber_yields_to_hold_and_resumes() {
        let trace = Arc::new(std::sync::Mutex::new(Vec::new()));
        let trace2 = trace.clone();
        let mut fiber = Fiber::new(
            move || {
                trace2.lock().unwrap().push(1);
                yield_to_hold();
                trace2.lock().unwrap().push(2);
            },
            64 * 1024,
            None,
        )
        .unwrap();
        fiber.swap_in();
        assert_eq!(fiber.state(), State::Hold);
        assert_eq!(*trace.lock().unwrap(), vec![1]);
        fiber.swap_in();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn fiber_captures_panic_as_exception_state() {
        let mut fiber = Fiber::new(
            || {
                panic!("boom");
            },
            64 * 1024,
            None,
        )
        .unwrap();
        fiber.swap_in();
        assert_eq!(fiber.state(), State::Exception);
    }

    #[test]
    fn swap_in_on_exec_fiber_is_a_contract_violation() {
        let mut fiber = Fiber::new(
            || {
                yield_to_hold();
            },
            64 * 1024,
            None,
        )
        .unwrap();
        fiber.state = State::Exec;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fiber.swap_in()));
        assert!(result.is_err());
    }
}
