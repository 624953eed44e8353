//! Coroutine stacks.
//!
//! Flat allocation, no guard page: the teacher's `stack_protected.rs` `mmap`s
//! a guard page after every stack to catch overflows, but the distilled spec
//! explicitly drops that requirement (§4.1, "no guard page required"), so
//! this wraps `context`'s `FixedSizeStack` rather than its guard-paged
//! `ProtectedFixedSizeStack`.

use std::sync::atomic::{AtomicI64, Ordering};

use context::stack::{FixedSizeStack, Stack as ContextStack};

use crate::error::{Result, RuntimeError};

static LIVE_FIBER_COUNT: AtomicI64 = AtomicI64::new(0);
static NEXT_FIBER_ID: AtomicI64 = AtomicI64::new(1);

/// Returns the number of fibers that currently own a stack.
pub fn live_fiber_count() -> i64 {
    LIVE_FIBER_COUNT.load(Ordering::SeqCst)
}

pub(crate) fn fiber_count_inc() {
    LIVE_FIBER_COUNT.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn fiber_count_dec() {
    LIVE_FIBER_COUNT.fetch_sub(1, Ordering::SeqCst);
}

/// Assigns the next monotonic fiber identity.
pub fn next_fiber_id() -> u64 {
    NEXT_FIBER_ID.fetch_add(1, Ordering::SeqCst) as u64
}

/// A flat, heap-allocated coroutine stack (no guard page).
pub struct Stack {
    inner: FixedSizeStack,
}

impl Stack {
    /// Allocates a new stack of at least `size` bytes.
    pub fn new(size: usize) -> Result<Stack> {
        if size == 0 {
            return Err(RuntimeError::StackAlloc("zero-sized stack requested".into()));
        }
        Ok(Stack {
            inner: FixedSizeStack::new(size),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    pub(crate) fn context_stack(&self) -> &FixedSizeStack {
        &self.inner
    }
}

/// Caches stacks by minimum size so repeated fiber spawns don't pay a fresh
/// allocation every time. Mirrors the teacher's `StackPool`.
pub struct StackPool {
    stacks: Vec<Stack>,
    max_cached: usize,
}

impl StackPool {
    pub fn new() -> StackPool {
        StackPool {
            stacks: Vec::new(),
            max_cached: 10,
        }
    }

    pub fn take_stack(&mut self, min_size: usize) -> Result<Stack> {
        match self.stacks.iter().position(|s| min_size <= s.len()) {
            Some(idx) => Ok(self.stacks.swap_remove(idx)),
            None => Stack::new(min_size),
        }
    }

    pub fn give_stack(&mut self, stack: Stack) {
        if self.stacks.len() < self.max_cached {
            self.stacks.push(stack);
        }
    }
}

impl Default for StackPool {
    fn default() -> StackPool {
        StackPool::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_pool_reuses_large_enough_stack() {
        let mut pool = StackPool::new();
        let s = pool.take_stack(64 * 1024).unwrap();
        let len = s.len();
        pool.give_stack(s);
        let s = pool.take_stack(4096).unwrap();
        assert_eq!(s.len(), len);
    }

    #[test]
    fn stack_pool_allocates_fresh_when_too_small() {
        let mut pool = StackPool::new();
        let s = pool.take_stack(64 * 1024).unwrap();
        pool.give_stack(s);
        let s = pool.take_stack(256 * 1024).unwrap();
        assert!(s.len() >= 256 * 1024);
    }

    #[test]
    fn zero_size_stack_is_an_error() {
        assert!(Stack::new(0).is_err());
    }
}
