// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The raw operations the hook layer wraps.
//!
//! Hooked functions never call libc directly; they go through the
//! process-wide [`Syscalls`] backend. [`OsSyscalls`] is the default and is
//! used unless another backend is installed before first use.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::sync::OnceLock;
use std::time::Duration;

use super::addr::RawAddr;
use crate::error::RuntimeError;

/// Blocking-capable primitives. Errors carry the OS error code so the
/// hook layer can recognize `EINTR`, `EAGAIN` and `EINPROGRESS`.
pub trait Syscalls: Send + Sync + 'static {
    /// Block the OS thread.
    fn sleep(&self, dur: Duration);

    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd>;
    fn connect(&self, fd: RawFd, addr: &RawAddr) -> io::Result<()>;
    fn accept(&self, fd: RawFd) -> io::Result<(RawFd, RawAddr)>;

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;
    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize>;
    fn recv_from(&self, fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<(usize, RawAddr)>;
    /// # Safety
    /// `msg` must point to a valid `msghdr` whose buffers outlive the call.
    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize>;

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn send(&self, fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize>;
    fn send_to(&self, fd: RawFd, buf: &[u8], flags: i32, addr: &RawAddr) -> io::Result<usize>;
    /// # Safety
    /// `msg` must point to a valid `msghdr` whose buffers outlive the call.
    unsafe fn sendmsg(&self, fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize>;

    fn close(&self, fd: RawFd) -> io::Result<()>;

    fn fcntl_getfl(&self, fd: RawFd) -> io::Result<i32>;
    fn fcntl_setfl(&self, fd: RawFd, flags: i32) -> io::Result<()>;
    fn ioctl_fionbio(&self, fd: RawFd, on: bool) -> io::Result<()>;

    fn getsockopt_int(&self, fd: RawFd, level: i32, name: i32) -> io::Result<i32>;
    /// `SO_RCVTIMEO` / `SO_SNDTIMEO`; `None` clears the timeout.
    fn set_socket_timeout(&self, fd: RawFd, name: i32, timeout: Option<Duration>) -> io::Result<()>;

    fn is_socket(&self, fd: RawFd) -> io::Result<bool>;
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// libc-backed syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSyscalls;

impl Syscalls for OsSyscalls {
    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }

    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
        cvt(unsafe { libc::socket(domain, ty, protocol) })
    }

    fn connect(&self, fd: RawFd, addr: &RawAddr) -> io::Result<()> {
        cvt(unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) }).map(drop)
    }

    fn accept(&self, fd: RawFd) -> io::Result<(RawFd, RawAddr)> {
        let mut addr = RawAddr::empty();
        let client = cvt(unsafe {
            libc::accept4(fd, addr.as_mut_ptr(), addr.len_mut(), libc::SOCK_CLOEXEC)
        })?;
        Ok((client, addr))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    }

    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        // IoSliceMut is ABI-compatible with iovec on Unix.
        cvt_size(unsafe {
            libc::readv(fd, bufs.as_mut_ptr() as *const libc::iovec, bufs.len() as libc::c_int)
        })
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
        cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) })
    }

    fn recv_from(&self, fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<(usize, RawAddr)> {
        let mut addr = RawAddr::empty();
        let n = cvt_size(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                addr.as_mut_ptr(),
                addr.len_mut(),
            )
        })?;
        Ok((n, addr))
    }

    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
        cvt_size(libc::recvmsg(fd, msg, flags))
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        cvt_size(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
    }

    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        cvt_size(unsafe {
            libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as libc::c_int)
        })
    }

    fn send(&self, fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
        cvt_size(unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) })
    }

    fn send_to(&self, fd: RawFd, buf: &[u8], flags: i32, addr: &RawAddr) -> io::Result<usize> {
        cvt_size(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                addr.as_ptr(),
                addr.len(),
            )
        })
    }

    unsafe fn sendmsg(&self, fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize> {
        cvt_size(libc::sendmsg(fd, msg, flags))
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe { libc::close(fd) }).map(drop)
    }

    fn fcntl_getfl(&self, fd: RawFd) -> io::Result<i32> {
        cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })
    }

    fn fcntl_setfl(&self, fd: RawFd, flags: i32) -> io::Result<()> {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(drop)
    }

    fn ioctl_fionbio(&self, fd: RawFd, on: bool) -> io::Result<()> {
        let mut arg: libc::c_int = on.into();
        cvt(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg as *mut libc::c_int) }).map(drop)
    }

    fn getsockopt_int(&self, fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(fd, level, name, &mut value as *mut _ as *mut libc::c_void, &mut len)
        })?;
        Ok(value)
    }

    fn set_socket_timeout(&self, fd: RawFd, name: i32, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    fn is_socket(&self, fd: RawFd) -> io::Result<bool> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        cvt(unsafe { libc::fstat(fd, &mut st) })?;
        Ok(st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
    }
}

static BACKEND: OnceLock<Box<dyn Syscalls>> = OnceLock::new();

/// Choose the syscall backend for the whole process. Fails once any
/// hooked call has run or a backend was already installed.
pub fn install_syscalls<S: Syscalls>(backend: S) -> Result<(), RuntimeError> {
    BACKEND
        .set(Box::new(backend))
        .map_err(|_| RuntimeError::SyscallsInstalled)
}

pub(crate) fn backend() -> &'static dyn Syscalls {
    &**BACKEND.get_or_init(|| Box::new(OsSyscalls) as Box<dyn Syscalls>)
}
