//! The process-wide descriptor table.
//!
//! Grounded on `original_source/code/fd_manager/fd_manager.cpp`/`fd_manager.h`
//! for the entry shape (socketness probe via `fstat`, forced `O_NONBLOCK` on
//! sockets, independent user-vs-system nonblocking bits) and on the teacher's
//! singleton pattern (a `lazy_static`-less `OnceLock` replaces the teacher's
//! `static mut`/`Once` idiom, which is no longer sound to write by hand).

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use libc::{c_int, mode_t, S_IFMT, S_IFSOCK};

/// Per-fd metadata the syscall hooks consult to decide whether to intercept.
pub struct FileDescriptor {
    fd: c_int,
    is_socket: bool,
    system_non_block: bool,
    user_non_block: bool,
    closed: bool,
    recv_timeout_ms: i64,
    send_timeout_ms: i64,
}

impl FileDescriptor {
    fn probe(fd: c_int) -> FileDescriptor {
        let is_socket = fd_is_socket(fd);
        let mut entry = FileDescriptor {
            fd,
            is_socket,
            system_non_block: false,
            user_non_block: false,
            closed: false,
            recv_timeout_ms: -1,
            send_timeout_ms: -1,
        };
        if is_socket {
            force_nonblock(fd);
            entry.system_non_block = true;
        }
        entry
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether this descriptor should be left alone by the hooks: not a
    /// socket, or the user explicitly asked for non-blocking behavior.
    pub fn bypasses_hooks(&self) -> bool {
        !self.is_socket || self.user_non_block
    }

    pub fn user_non_block(&self) -> bool {
        self.user_non_block
    }

    pub fn set_user_non_block(&mut self, value: bool) {
        self.user_non_block = value;
    }

    pub fn recv_timeout_ms(&self) -> i64 {
        self.recv_timeout_ms
    }

    pub fn send_timeout_ms(&self) -> i64 {
        self.send_timeout_ms
    }

    pub fn set_recv_timeout_ms(&mut self, ms: i64) {
        self.recv_timeout_ms = ms;
    }

    pub fn set_send_timeout_ms(&mut self, ms: i64) {
        self.send_timeout_ms = ms;
    }
}

fn fd_is_socket(fd: c_int) -> bool {
    unsafe {
        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut stat) != 0 {
            return false;
        }
        (stat.st_mode as mode_t & S_IFMT) == S_IFSOCK
    }
}

fn force_nonblock(fd: c_int) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Process-wide fd -> `FileDescriptor` map, growing on demand. Entries are
/// reference-counted, mirroring the original's `std::shared_ptr<FileDescriptor>`
/// (`fd_manager.h`): `get` hands out an owned `Arc`, so a caller holding one
/// keeps the entry alive even if `remove` clears the table's own slot for it
/// concurrently, rather than borrowing a reference into storage the table
/// might drop out from under it.
pub struct FileDescriptorManager {
    entries: RwLock<Vec<Option<Arc<Mutex<FileDescriptor>>>>>,
}

impl FileDescriptorManager {
    fn new() -> FileDescriptorManager {
        FileDescriptorManager {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Returns the entry for `fd`, lazily creating (and `fstat`-probing) one
    /// if `auto_create` is set and none exists yet.
    pub fn get(&self, fd: c_int, auto_create: bool) -> Option<Arc<Mutex<FileDescriptor>>> {
        let idx = fd as usize;
        {
            let entries = self.entries.read().unwrap();
            if let Some(Some(entry)) = entries.get(idx) {
                return Some(entry.clone());
            }
        }
        if !auto_create || fd < 0 {
            return None;
        }
        let mut entries = self.entries.write().unwrap();
        if entries.len() <= idx {
            entries.resize_with(idx + 1, || None);
        }
        if entries[idx].is_none() {
            entries[idx] = Some(Arc::new(Mutex::new(FileDescriptor::probe(fd))));
        }
        entries[idx].clone()
    }

    pub fn get_mut(&self, fd: c_int, auto_create: bool) -> bool {
        self.get(fd, auto_create).is_some()
    }

    /// Runs `f` with exclusive access to `fd`'s entry, creating it first if
    /// requested. Used by hooks that need to mutate timeouts or the
    /// user-nonblock bit.
    pub fn with_entry_mut<R>(&self, fd: c_int, auto_create: bool, f: impl FnOnce(&mut FileDescriptor) -> R) -> Option<R> {
        let entry = self.get(fd, auto_create)?;
        Some(f(&mut entry.lock().unwrap()))
    }

    pub fn remove(&self, fd: c_int) {
        let idx = fd as usize;
        let mut entries = self.entries.write().unwrap();
        if let Some(slot) = entries.get_mut(idx) {
            if let Some(entry) = slot {
                entry.lock().unwrap().closed = true;
            }
            *slot = None;
        }
    }
}

static FD_MANAGER: OnceLock<FileDescriptorManager> = OnceLock::new();

/// The process-wide descriptor table singleton.
pub fn fd_manager() -> &'static FileDescriptorManager {
    FD_MANAGER.get_or_init(FileDescriptorManager::new)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn non_socket_fd_is_not_treated_as_a_socket() {
        let manager = FileDescriptorManager::new();
        // fd 1 (stdout) exists in the test process but is never a socket.
        let entry = manager.get(1, true).unwrap();
        let entry = entry.lock().unwrap();
        assert!(!entry.is_socket());
        assert!(entry.bypasses_hooks());
    }

    #[test]
    fn get_outlives_a_concurrent_remove() {
        let manager = FileDescriptorManager::new();
        let entry = manager.get(1, true).unwrap();
        manager.remove(1);
        // The table's own slot is gone, but this caller's `Arc` keeps the
        // entry alive and readable.
        assert!(entry.lock().unwrap().is_closed());
        assert!(manager.get(1, false).is_none());
    }

    #[test]
    fn remove_clears_the_slot() {
        let manager = FileDescriptorManager::new();
        manager.get(1, true);
        manager.remove(1);
        assert!(manager.get(1, false).is_none());
    }
}
