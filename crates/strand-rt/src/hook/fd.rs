// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-descriptor metadata for hooked I/O.
//!
//! A descriptor gets an entry the first time the hook layer is asked to
//! track it. Sockets are switched to kernel non-blocking mode at that
//! point; what the *user* asked for is remembered separately so `fcntl`
//! and `ioctl` can report it back faithfully.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;

use super::sys::Syscalls;
use crate::config;

const NO_TIMEOUT: u64 = u64::MAX;

/// Which socket timeout an operation is bounded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: reads, receives, accept.
    Recv,
    /// `SO_SNDTIMEO`: writes and sends.
    Send,
}

impl TimeoutKind {
    pub(crate) fn sockopt(self) -> i32 {
        match self {
            TimeoutKind::Recv => libc::SO_RCVTIMEO,
            TimeoutKind::Send => libc::SO_SNDTIMEO,
        }
    }
}

#[derive(Debug)]
pub(crate) struct FdMeta {
    /// `fstat` succeeded when the entry was created.
    valid: bool,
    socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdMeta {
    fn new(fd: RawFd, sys: &dyn Syscalls) -> Self {
        let (valid, socket) = match sys.is_socket(fd) {
            Ok(socket) => (true, socket),
            Err(_) => (false, false),
        };

        let mut sys_nonblock = false;
        if socket {
            match sys.fcntl_getfl(fd) {
                Ok(flags) if flags & libc::O_NONBLOCK != 0 => sys_nonblock = true,
                Ok(flags) => match sys.fcntl_setfl(fd, flags | libc::O_NONBLOCK) {
                    Ok(()) => sys_nonblock = true,
                    Err(err) => tracing::warn!(fd, error = %err, "cannot make socket non-blocking"),
                },
                Err(err) => tracing::warn!(fd, error = %err, "cannot read socket flags"),
            }
        }

        Self {
            valid,
            socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_socket(&self) -> bool {
        self.socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    fn timeout_slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }

    /// Timeout in milliseconds, `None` when unbounded.
    pub fn timeout_ms(&self, kind: TimeoutKind) -> Option<u64> {
        match self.timeout_slot(kind).load(Ordering::Acquire) {
            NO_TIMEOUT => None,
            ms => Some(ms),
        }
    }

    /// A zero duration means "no timeout", as with `SO_RCVTIMEO`.
    pub fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) {
        let ms = match timeout {
            Some(d) if !d.is_zero() => (d.as_millis() as u64).clamp(1, NO_TIMEOUT - 1),
            _ => NO_TIMEOUT,
        };
        self.timeout_slot(kind).store(ms, Ordering::Release);
    }
}

/// Fd-indexed table of metadata, grown by half again when too small.
pub(crate) struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl FdTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity.max(1)]),
        }
    }

    /// Look up `fd`, creating its entry when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool, sys: &dyn Syscalls) -> Option<Arc<FdMeta>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(meta)) => return Some(meta.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let mut len = slots.len();
            while len <= idx {
                len = (len + len / 2).max(len + 1);
            }
            slots.resize(len, None);
        }
        // Another thread may have won the race.
        let meta = slots[idx].get_or_insert_with(|| Arc::new(FdMeta::new(fd, sys)));
        Some(meta.clone())
    }

    pub fn remove(&self, fd: RawFd) -> Option<Arc<FdMeta>> {
        let idx = usize::try_from(fd).ok()?;
        self.slots.write().get_mut(idx)?.take()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.read().len()
    }
}

pub(crate) fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(|| FdTable::with_capacity(config::DEFAULT_FD_CAPACITY))
}
