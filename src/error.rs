//! Resource-exhaustion errors raised by fallible constructors.
//!
//! Syscall-level failures (EBADF, ECONNREFUSED, ETIMEDOUT, ...) are never
//! represented here: hooked functions preserve the POSIX `-1`/`errno` calling
//! convention and are not allowed to return a `Result`. This type only covers
//! failures that make a constructor unable to produce a usable object.

use std::fmt;
use std::io;

/// Errors that can prevent the runtime's core objects from being built.
#[derive(Debug)]
pub enum RuntimeError {
    /// Failed to allocate a coroutine stack.
    StackAlloc(String),
    /// `epoll_create1` failed.
    EpollCreate(io::Error),
    /// `pipe2` for the tickle channel failed.
    PipeCreate(io::Error),
    /// Spawning a worker thread failed.
    ThreadSpawn(io::Error),
    /// Resolving a real libc symbol via `dlsym` failed.
    HookResolve(&'static str),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackAlloc(msg) => write!(f, "failed to allocate coroutine stack: {}", msg),
            RuntimeError::EpollCreate(e) => write!(f, "epoll_create1 failed: {}", e),
            RuntimeError::PipeCreate(e) => write!(f, "pipe2 failed: {}", e),
            RuntimeError::ThreadSpawn(e) => write!(f, "failed to spawn worker thread: {}", e),
            RuntimeError::HookResolve(name) => write!(f, "failed to resolve real symbol for {}", name),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::EpollCreate(e) | RuntimeError::PipeCreate(e) | RuntimeError::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
