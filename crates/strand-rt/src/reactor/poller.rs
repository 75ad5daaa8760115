// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thin epoll wrapper plus the self-wake pipe.
//!
//! All registrations are edge-triggered. The epoll user data is the fd
//! number itself; the reactor maps it back to its slot.

use std::io;
use std::os::unix::io::RawFd;

use super::Event;

pub(crate) const MAX_EVENTS: usize = 64;

pub(crate) struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    pub fn add(&self, fd: RawFd, interest: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Event::empty())
    }

    /// Replace the registration of `fd` with `remaining`, removing it
    /// entirely when nothing remains.
    pub fn rearm(&self, fd: RawFd, remaining: Event) -> io::Result<()> {
        if remaining.is_empty() {
            self.delete(fd)
        } else {
            self.modify(fd, remaining)
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | interest.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block up to `timeout_ms` for readiness. Interrupted waits are retried.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

/// Non-blocking pipe whose read end sits in the epoll set so any thread
/// can interrupt a blocked `epoll_wait`.
pub(crate) struct TicklePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl TicklePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn notify(&self) {
        // A full pipe already guarantees a pending wake-up.
        unsafe {
            libc::write(self.write_fd, b"T".as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for TicklePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
