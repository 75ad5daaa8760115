// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking calls that suspend the coroutine instead of the thread.
//!
//! Every function here has the shape of the syscall it replaces. Inside a
//! reactor coroutine with hooking enabled, a call on a tracked socket that
//! would block registers interest with the reactor and suspends; the
//! coroutine is resumed when the descriptor is ready or its timeout fires.
//! Anywhere else the call goes straight to the [`Syscalls`] backend.
//!
//! Descriptors are tracked when created through [`socket`] or [`accept`],
//! or explicitly with [`track`]. Tracked sockets are always non-blocking in
//! the kernel; [`fcntl_getfl`] and [`ioctl_fionbio`] keep up the user's
//! view of the flag.

mod addr;
mod fd;
mod sys;

use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

pub use addr::RawAddr;
pub use fd::TimeoutKind;
pub use sys::{install_syscalls, OsSyscalls, Syscalls};

use crate::config;
use crate::context;
use crate::coroutine::Coroutine;
use crate::reactor::{Event, Reactor, ReactorHandle};
use fd::{fd_table, FdMeta};
use sys::backend;

/// Readiness wake-ups tolerated per call before the would-block error is
/// returned to the caller.
const MAX_IO_RETRIES: usize = 64;

/// Whether hooking is on for the calling thread. Reactor and scheduler
/// workers turn it on for themselves.
pub fn is_enabled() -> bool {
    context::hook_enabled()
}

pub fn set_enabled(on: bool) {
    context::set_hook_enabled(on);
}

/// Set by a deadline timer; read by the waiter once it is resumed.
#[derive(Debug, Default)]
struct TimeoutFlag {
    fired: AtomicBool,
}

impl TimeoutFlag {
    /// Returns true for the first caller only.
    fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

fn timed_out() -> io::Error {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
}

fn bad_fd() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

/// The reactor to park on, if the caller may be suspended at all.
fn hookable_reactor() -> Option<ReactorHandle> {
    if !is_enabled() || !Coroutine::in_coroutine() {
        return None;
    }
    Reactor::current()
}

/// Metadata for `fd` if it is a live tracked socket.
fn tracked_socket(fd: RawFd) -> Option<Arc<FdMeta>> {
    fd_table()
        .get(fd, false, backend())
        .filter(|meta| meta.is_socket() && !meta.is_closed())
}

/// Park the current coroutine until `event` fires on `fd`, or until
/// `timeout_ms` passes, in which case the registration is cancelled and
/// `ETIMEDOUT` is returned.
fn wait_ready(
    reactor: &ReactorHandle,
    fd: RawFd,
    event: Event,
    timeout_ms: Option<u64>,
) -> io::Result<()> {
    let flag = Arc::new(TimeoutFlag::default());
    let timer = timeout_ms.map(|ms| {
        let weak = Arc::downgrade(&flag);
        let handle = reactor.clone();
        reactor.add_condition_timer(
            ms,
            move || {
                if weak.upgrade().is_some_and(|flag| flag.fire()) {
                    tracing::debug!(fd, ?event, timeout_ms = ms, "hooked call timed out");
                    handle.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&flag),
            false,
        )
    });

    if let Err(err) = reactor.add_event(fd, event, None) {
        if let Some(timer) = &timer {
            timer.cancel();
        }
        tracing::error!(fd, ?event, error = %err, "cannot wait for readiness");
        return Err(err.into_io());
    }

    Coroutine::suspend();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    if flag.is_fired() {
        return Err(timed_out());
    }
    Ok(())
}

/// Run `op`, turning would-block into a coroutine suspension.
fn do_io<T, F>(fd: RawFd, event: Event, kind: TimeoutKind, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    if !is_enabled() {
        return op();
    }
    let Some(meta) = fd_table().get(fd, false, backend()) else {
        return op();
    };
    if meta.is_closed() {
        return Err(bad_fd());
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return op();
    }
    let Some(reactor) = hookable_reactor() else {
        return op();
    };

    let mut wakeups = 0;
    loop {
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => err,
            Err(err) => return Err(err),
        };
        if wakeups == MAX_IO_RETRIES {
            tracing::warn!(fd, ?event, "giving up after repeated spurious wake-ups");
            return Err(err);
        }
        wakeups += 1;

        wait_ready(&reactor, fd, event, meta.timeout_ms(kind))?;
        if meta.is_closed() {
            return Err(bad_fd());
        }
    }
}

/// Start tracking a descriptor created outside the hook layer. Sockets
/// become non-blocking in the kernel.
pub fn track(fd: RawFd) -> io::Result<()> {
    let table = fd_table();
    let meta = table.get(fd, true, backend()).ok_or_else(bad_fd)?;
    if !meta.is_valid() {
        table.remove(fd);
        return Err(bad_fd());
    }
    Ok(())
}

fn sleep_ms(ms: u64, fallback: Duration) -> io::Result<()> {
    let Some(reactor) = hookable_reactor() else {
        backend().sleep(fallback);
        return Ok(());
    };
    let co = Coroutine::current();
    let handle = reactor.clone();
    reactor.add_timer(ms, move || handle.schedule_coroutine(co.clone()), false);
    Coroutine::suspend();
    Ok(())
}

pub fn sleep(secs: u64) -> io::Result<()> {
    sleep_ms(secs.saturating_mul(1000), Duration::from_secs(secs))
}

pub fn usleep(micros: u64) -> io::Result<()> {
    sleep_ms(micros / 1000, Duration::from_micros(micros))
}

/// Sub-millisecond remainders round up so a non-zero request always yields.
pub fn nanosleep(dur: Duration) -> io::Result<()> {
    let ms = dur.as_nanos().div_ceil(1_000_000);
    sleep_ms(u64::try_from(ms).unwrap_or(u64::MAX), dur)
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = backend().socket(domain, ty, protocol)?;
    if is_enabled() {
        fd_table().get(fd, true, backend());
    }
    Ok(fd)
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(config::DEFAULT_CONNECT_TIMEOUT_MS);

fn connect_timeout() -> Option<Duration> {
    static LISTEN: Once = Once::new();
    LISTEN.call_once(|| {
        let var = config::connect_timeout_ms();
        var.add_listener(|old, new| {
            tracing::info!(old, new, "tcp connect timeout changed");
            CONNECT_TIMEOUT_MS.store(*new, Ordering::Release);
        });
        CONNECT_TIMEOUT_MS.store(var.get(), Ordering::Release);
    });
    match CONNECT_TIMEOUT_MS.load(Ordering::Acquire) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// Connect with the configured `tcp.connect_timeout_ms`.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, connect_timeout())
}

/// Connect, suspending until the handshake completes. `None` or a zero
/// duration waits indefinitely.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SocketAddr,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let sys = backend();
    let raw = RawAddr::from_std(addr);
    if !is_enabled() {
        return sys.connect(fd, &raw);
    }
    let meta = fd_table().get(fd, true, sys).ok_or_else(bad_fd)?;
    if meta.is_closed() {
        return Err(bad_fd());
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return sys.connect(fd, &raw);
    }
    let Some(reactor) = hookable_reactor() else {
        return sys.connect(fd, &raw);
    };

    match sys.connect(fd, &raw) {
        Ok(()) => return Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => return Err(err),
    }

    let timeout_ms = timeout
        .filter(|d| !d.is_zero())
        .map(|d| (d.as_millis() as u64).max(1));
    wait_ready(&reactor, fd, Event::WRITE, timeout_ms)?;

    match sys.getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)? {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// Accept a connection. The peer address is returned as the kernel filled
/// it in; [`RawAddr::to_std`] converts IP families.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, RawAddr)> {
    let sys = backend();
    let (client, addr) = do_io(fd, Event::READ, TimeoutKind::Recv, || sys.accept(fd))?;
    if is_enabled() {
        fd_table().get(client, true, sys);
    }
    Ok((client, addr))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || backend().read(fd, buf))
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || backend().readv(fd, bufs))
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || backend().recv(fd, buf, flags))
}

pub fn recv_from(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<(usize, RawAddr)> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || {
        backend().recv_from(fd, buf, flags)
    })
}

/// # Safety
/// `msg` must point to a valid `msghdr` whose buffers outlive the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || unsafe {
        backend().recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || backend().write(fd, buf))
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || backend().writev(fd, bufs))
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || backend().send(fd, buf, flags))
}

pub fn send_to(fd: RawFd, buf: &[u8], flags: i32, addr: &SocketAddr) -> io::Result<usize> {
    let raw = RawAddr::from_std(addr);
    do_io(fd, Event::WRITE, TimeoutKind::Send, || {
        backend().send_to(fd, buf, flags, &raw)
    })
}

/// # Safety
/// `msg` must point to a valid `msghdr` whose buffers outlive the call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || unsafe {
        backend().sendmsg(fd, msg, flags)
    })
}

/// Wake every coroutine waiting on `fd`, forget its metadata, then close.
pub fn close(fd: RawFd) -> io::Result<()> {
    let table = fd_table();
    if let Some(meta) = table.get(fd, false, backend()) {
        meta.mark_closed();
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        table.remove(fd);
    }
    backend().close(fd)
}

/// `F_GETFL`, with `O_NONBLOCK` as the user last set it.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<i32> {
    let flags = backend().fcntl_getfl(fd)?;
    Ok(match tracked_socket(fd) {
        Some(meta) if meta.user_nonblock() => flags | libc::O_NONBLOCK,
        Some(_) => flags & !libc::O_NONBLOCK,
        None => flags,
    })
}

/// `F_SETFL`. On a tracked socket `O_NONBLOCK` is recorded as the user's
/// wish and the kernel flag stays as the hook layer needs it.
pub fn fcntl_setfl(fd: RawFd, flags: i32) -> io::Result<()> {
    let mut flags = flags;
    if let Some(meta) = tracked_socket(fd) {
        meta.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
        if meta.sys_nonblock() {
            flags |= libc::O_NONBLOCK;
        } else {
            flags &= !libc::O_NONBLOCK;
        }
    }
    backend().fcntl_setfl(fd, flags)
}

/// `ioctl(FIONBIO)`. Same rule as [`fcntl_setfl`].
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> io::Result<()> {
    match tracked_socket(fd) {
        Some(meta) => {
            meta.set_user_nonblock(on);
            backend().ioctl_fionbio(fd, on || meta.sys_nonblock())
        }
        None => backend().ioctl_fionbio(fd, on),
    }
}

pub fn getsockopt_int(fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
    backend().getsockopt_int(fd, level, name)
}

/// Set `SO_RCVTIMEO` / `SO_SNDTIMEO`. Hooked calls on a tracked socket
/// honour the timeout while suspended.
pub fn set_timeout(fd: RawFd, kind: TimeoutKind, timeout: Option<Duration>) -> io::Result<()> {
    if let Some(meta) = fd_table().get(fd, false, backend()) {
        meta.set_timeout(kind, timeout);
    }
    backend().set_socket_timeout(fd, kind.sockopt(), timeout)
}

/// The timeout a hooked call on `fd` is bounded by.
pub fn timeout(fd: RawFd, kind: TimeoutKind) -> Option<Duration> {
    fd_table()
        .get(fd, false, backend())
        .and_then(|meta| meta.timeout_ms(kind))
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn socketpair() -> (RawFd, RawFd) {
        let mut sv = [0 as RawFd; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (sv[0], sv[1])
    }

    fn kernel_nonblock(fd: RawFd) -> bool {
        OsSyscalls.fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK != 0
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn fcntl_shows_the_users_flag() {
        let (a, b) = socketpair();
        track(a).unwrap();
        assert!(kernel_nonblock(a));
        assert_eq!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);

        let flags = fcntl_getfl(a).unwrap();
        fcntl_setfl(a, flags | libc::O_NONBLOCK).unwrap();
        assert_ne!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);

        fcntl_setfl(a, flags & !libc::O_NONBLOCK).unwrap();
        assert_eq!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        assert!(kernel_nonblock(a));

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn ioctl_never_clears_kernel_nonblock() {
        let (a, b) = socketpair();
        track(a).unwrap();

        ioctl_fionbio(a, true).unwrap();
        assert_ne!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        ioctl_fionbio(a, false).unwrap();
        assert_eq!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        assert!(kernel_nonblock(a));

        // Untracked descriptors get exactly what they ask for.
        ioctl_fionbio(b, true).unwrap();
        assert!(kernel_nonblock(b));
        ioctl_fionbio(b, false).unwrap();
        assert!(!kernel_nonblock(b));

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn timeouts_are_recorded_on_tracked_sockets() {
        let (a, b) = socketpair();
        track(a).unwrap();
        assert_eq!(timeout(a, TimeoutKind::Recv), None);

        set_timeout(a, TimeoutKind::Recv, Some(Duration::from_millis(150))).unwrap();
        assert_eq!(timeout(a, TimeoutKind::Recv), Some(Duration::from_millis(150)));
        assert_eq!(timeout(a, TimeoutKind::Send), None);

        set_timeout(a, TimeoutKind::Recv, None).unwrap();
        assert_eq!(timeout(a, TimeoutKind::Recv), None);

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn close_forgets_metadata() {
        let (a, b) = socketpair();
        track(a).unwrap();
        assert!(fd_table().get(a, false, backend()).is_some());
        close(a).unwrap();
        assert!(fd_table().get(a, false, backend()).is_none());
        close(b).unwrap();
    }

    #[test]
    fn tracking_a_bad_fd_fails() {
        let err = track(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn timeout_flag_fires_once() {
        let flag = TimeoutFlag::default();
        assert!(!flag.is_fired());
        assert!(flag.fire());
        assert!(!flag.fire());
        assert!(flag.is_fired());
    }

    #[test]
    fn plain_thread_calls_go_straight_through() {
        assert!(!is_enabled());
        let (a, b) = socketpair();
        assert_eq!(write(b, b"hi").unwrap(), 2);
        let mut buf = [0u8; 4];
        assert_eq!(read(a, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn read_suspends_until_data_arrives() {
        let reactor = Reactor::new(1, false, "hook_read").unwrap();
        let (a, b) = socketpair();
        track(a).unwrap();
        let got: Arc<Mutex<Option<io::Result<Vec<u8>>>>> = Arc::new(Mutex::new(None));

        let slot = got.clone();
        reactor.schedule(move || {
            let mut buf = [0u8; 16];
            let res = read(a, &mut buf).map(|n| buf[..n].to_vec());
            *slot.lock() = Some(res);
        });

        wait_until(|| reactor.pending_events() == 1);
        assert_eq!(OsSyscalls.write(b, b"ping").unwrap(), 4);
        wait_until(|| got.lock().is_some());
        let res = got.lock().take().unwrap();
        assert_eq!(res.unwrap(), b"ping");

        reactor.stop();
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn sleep_lets_the_worker_run_other_work() {
        let reactor = Reactor::new(1, false, "hook_sleep").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        reactor.schedule(move || {
            usleep(30_000).unwrap();
            o.lock().push("slept");
        });
        let o = order.clone();
        reactor.schedule(move || o.lock().push("quick"));

        wait_until(|| order.lock().len() == 2);
        assert_eq!(*order.lock(), ["quick", "slept"]);
        reactor.stop();
    }
}
