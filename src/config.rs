//! Narrow configuration contract.
//!
//! The full hierarchical, YAML-backed configuration store the original
//! framework carries is out of scope (see SPEC_FULL.md §1): it is an
//! external collaborator the core never constructs. What the core *does*
//! own is exactly two named values, each behind its own `ConfigVar`-style
//! cell with change-listener support, mirroring the shape of the original
//! `ConfigVar<T>` (a `RwLock`-guarded value plus a map of on-change
//! callbacks) without pulling in a general-purpose config/serde dependency
//! for a two-key contract.

use std::sync::RwLock;

/// A single named configuration value with change-listener support.
pub struct ConfigVar<T: Clone + Send + Sync + 'static> {
    name: &'static str,
    value: RwLock<T>,
    listeners: RwLock<Vec<Box<dyn Fn(&T, &T) + Send + Sync>>>,
}

impl<T: Clone + Send + Sync + 'static> ConfigVar<T> {
    pub const fn new(name: &'static str, default: T) -> ConfigVar<T>
    where
        T: Copy,
    {
        ConfigVar {
            name,
            value: RwLock::new(default),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> T {
        self.value.read().expect("config lock poisoned").clone()
    }

    /// Sets the value and notifies listeners with (old, new) outside the lock.
    pub fn set(&self, new_value: T) {
        let old_value = {
            let mut guard = self.value.write().expect("config lock poisoned");
            let old = guard.clone();
            *guard = new_value.clone();
            old
        };
        let listeners = self.listeners.read().expect("config lock poisoned");
        for listener in listeners.iter() {
            listener(&old_value, &new_value);
        }
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("config lock poisoned")
            .push(Box::new(listener));
    }
}

/// Default coroutine stack size in bytes, unless overridden by the caller.
pub static FIBER_STACK_SIZE: ConfigVar<usize> = ConfigVar::new("fiber.stack_size", 1024 * 1024);

/// Default TCP connect timeout in milliseconds, used by the `connect` hook
/// when the caller doesn't supply its own.
pub static TCP_CONNECT_TIMEOUT_MS: ConfigVar<u64> = ConfigVar::new("tcp.connect.timeout", 5000);

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn config_var_defaults() {
        assert_eq!(FIBER_STACK_SIZE.get(), 1024 * 1024);
        assert_eq!(TCP_CONNECT_TIMEOUT_MS.get(), 5000);
    }

    #[test]
    fn config_var_set_notifies_listeners() {
        let var = ConfigVar::new("test.key", 1usize);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        var.add_listener(move |_old, new| seen2.store(*new, Ordering::SeqCst));
        var.set(42);
        assert_eq!(var.get(), 42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }
}
