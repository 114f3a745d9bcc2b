use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

use crate::sys::syscall;

/// Unblocks a loop's `epoll_wait` from another thread, backed by `eventfd`.
///
/// `eventfd` is a 64 bit counter: every wake adds 1, the loop's read handler
/// drains the whole counter in one 8-byte read, so any number of wakes
/// coalesce into a single readiness event.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds 1 to the counter. Short writes are logged, never fatal; the loop
    /// still makes progress on its next poll timeout.
    pub(crate) fn wake(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )) {
            Ok(n) if n as usize == buf.len() => {}
            Ok(n) => error!("wakeup write put {} bytes instead of 8", n),
            Err(err) => error!("wakeup write: {}", err),
        }
    }

    /// Resets the counter after the wakeup channel fired.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(n) if n as usize == buf.len() => {}
            Ok(n) => error!("wakeup read got {} bytes instead of 8", n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("wakeup read: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
