// src/cancel.rs
//
// Cancellation token for blocking waits.
//
// A CancelToken wraps a wakeable file descriptor that is polled alongside
// a port descriptor. Signalling the token from another thread makes the
// wait side of the poll readable, which the waiter reports as Cancelled.
//
// Platform adapters: Linux uses an eventfd, other Unixes a pipe pair. Both
// share the same contract: a signal delivered before anyone waits stays
// pending and is observed by the next wait; observers learn only that at
// least one signal arrived, not how many.
//
// The token must not be dropped while a thread is waiting on it; the token
// itself performs no reference counting.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
use nix::sys::eventfd::{EfdFlags, EventFd};

#[cfg(not(target_os = "linux"))]
use std::os::fd::{AsRawFd, OwnedFd};

pub struct CancelToken {
    #[cfg(target_os = "linux")]
    event: EventFd,
    /// Read end first, write end second.
    #[cfg(not(target_os = "linux"))]
    pipe: (OwnedFd, OwnedFd),
}

impl CancelToken {
    /// Allocate the wake primitive. Fails with `Resource` when the OS is
    /// out of descriptors.
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let event = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
                .map_err(|e| Error::Resource(format!("eventfd allocation failed: {}", e)))?;
            Ok(CancelToken { event })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let (read, write) = nix::unistd::pipe()
                .map_err(|e| Error::Resource(format!("pipe allocation failed: {}", e)))?;
            // The read end is drained opportunistically; it must not block.
            let flags = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_GETFL) };
            if flags >= 0 {
                unsafe {
                    libc::fcntl(read.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            Ok(CancelToken { pipe: (read, write) })
        }
    }

    /// Deliver a wake. Idempotent in effect: waiters only observe that a
    /// signal arrived.
    pub fn cancel(&self) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            match self.event.write(1) {
                Ok(_) => Ok(()),
                // Counter saturated: a wake is already pending, which is all
                // the observer needs to know.
                Err(Errno::EAGAIN) => Ok(()),
                Err(e) => Err(Error::Io(e)),
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            match nix::unistd::write(&self.pipe.1, b"W") {
                Ok(_) => Ok(()),
                Err(Errno::EAGAIN) => Ok(()),
                Err(e) => Err(Error::Io(e)),
            }
        }
    }

    /// The descriptor a waiter multiplexes on. Readable iff a signal is
    /// pending.
    pub(crate) fn wait_fd(&self) -> BorrowedFd<'_> {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsFd;
            self.event.as_fd()
        }
        #[cfg(not(target_os = "linux"))]
        {
            use std::os::fd::AsFd;
            self.pipe.0.as_fd()
        }
    }

    /// Consume any pending signal after a wake has been observed, so the
    /// token can be reused for a later wait.
    pub(crate) fn drain(&self) {
        #[cfg(target_os = "linux")]
        {
            let _ = self.event.read();
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut scratch = [0u8; 16];
            while matches!(nix::unistd::read(&self.pipe.0, &mut scratch), Ok(n) if n > 0) {}
        }
    }
}
