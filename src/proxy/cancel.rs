//! Cancellable blocking I/O
//!
//! Relay threads block in `read()` on descriptors that another thread may
//! need to interrupt. Every read or write first polls the descriptor together
//! with an eventfd; cancelling the token makes the eventfd readable for good,
//! so all current and future waits return `ConnectionAborted` without the
//! descriptors being closed.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::debug;

/// Shared stop signal for one proxy session
pub struct CancelToken {
    cancelled: AtomicBool,
    wake: EventFd,
}

impl CancelToken {
    pub fn new() -> io::Result<Self> {
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self {
            cancelled: AtomicBool::new(false),
            wake,
        })
    }

    /// Request cancellation; repeated calls are no-ops
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // The counter is never read back, so the eventfd stays readable
        if let Err(e) = self.wake.write(1) {
            debug!("Failed to signal cancel eventfd: {}", e);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until `fd` is readable or the token is cancelled
    pub fn wait_readable(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.wait(fd, PollFlags::POLLIN)
    }

    /// Block until `fd` is writable or the token is cancelled
    pub fn wait_writable(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.wait(fd, PollFlags::POLLOUT)
    }

    fn wait(&self, fd: BorrowedFd<'_>, events: PollFlags) -> io::Result<()> {
        loop {
            if self.is_cancelled() {
                return Err(aborted());
            }

            let mut fds = [
                PollFd::new(fd, events),
                PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let woken = fds[1].revents().is_some_and(|r| !r.is_empty());
            if woken || self.is_cancelled() {
                return Err(aborted());
            }
            // Hangup and error conditions are left for the next read or write to report
            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                return Ok(());
            }
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "operation cancelled")
}

/// Borrowed endpoint whose reads and writes honour a [`CancelToken`]
pub struct CancellableIo<'a, T> {
    inner: &'a T,
    token: &'a CancelToken,
}

impl<'a, T> CancellableIo<'a, T> {
    pub fn new(inner: &'a T, token: &'a CancelToken) -> Self {
        Self { inner, token }
    }
}

impl<T> Read for CancellableIo<'_, T>
where
    T: AsFd,
    for<'b> &'b T: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.token.wait_readable(self.inner.as_fd())?;
        let mut inner = self.inner;
        inner.read(buf)
    }
}

impl<T> Write for CancellableIo<'_, T>
where
    T: AsFd,
    for<'b> &'b T: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.token.wait_writable(self.inner.as_fd())?;
        let mut inner = self.inner;
        inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner;
        inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_read_passes_data_through() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let token = CancelToken::new().unwrap();

        b.write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = CancellableIo::new(&a, &token).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_cancel_interrupts_blocked_read() {
        let (a, _b) = UnixStream::pair().unwrap();
        let token = Arc::new(CancelToken::new().unwrap());

        let t = token.clone();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            CancellableIo::new(&a, &t).read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        token.cancel();

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_is_sticky_and_idempotent() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let token = CancelToken::new().unwrap();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());

        // Pending data does not win over cancellation
        b.write_all(b"late").unwrap();
        let mut buf = [0u8; 16];
        let mut endpoint = CancellableIo::new(&a, &token);
        for _ in 0..3 {
            let err = endpoint.read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        }
        assert!(endpoint.write(b"x").is_err());
    }
}
