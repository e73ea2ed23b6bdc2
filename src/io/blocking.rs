// src/io/blocking.rs
//
// Scalar read/write primitives.
//
// Writes loop over partial transfers and retry transparently when a signal
// interrupts the syscall. Reads come in three shapes: a snapshot read that
// never blocks beyond the port's VTIME window, a single-attempt read into a
// caller buffer with optional cancellable blocking, and a fully blocking
// read that waits for data or cancellation, whichever comes first.

use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::termios;
use nix::unistd;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::io::{self, WaitOutcome};
use crate::port::SerialPort;

/// Pause after a signal interrupts a bulk write, giving the signal source
/// a chance to settle before the next attempt.
const WRITE_EINTR_BACKOFF: Duration = Duration::from_millis(20);

impl SerialPort {
    /// Write all of `data` to the port.
    ///
    /// With `inter_byte_delay` unset, the write loops over partial
    /// transfers until every byte is accepted, then drains the output
    /// queue. With a delay, bytes go out one at a time, each drained and
    /// followed by the pause — pacing for peers that cannot keep up with
    /// line rate.
    ///
    /// Zero-length input fails with `EmptyWrite` before any syscall:
    /// write(2) with a zero count is undefined on ttys.
    ///
    /// On a fatal error the returned `Error::Write` carries the exact
    /// number of bytes the descriptor accepted first.
    pub fn write(&self, data: &[u8], inter_byte_delay: Option<Duration>) -> Result<()> {
        if data.is_empty() {
            return Err(Error::EmptyWrite);
        }

        match inter_byte_delay {
            None => {
                let mut written = 0;
                while written < data.len() {
                    match unistd::write(self.fd(), &data[written..]) {
                        Ok(0) => continue,
                        Ok(n) => written += n,
                        Err(Errno::EINTR) => {
                            std::thread::sleep(WRITE_EINTR_BACKOFF);
                            continue;
                        }
                        Err(errno) => return Err(Error::Write { errno, written }),
                    }
                }
                let _ = termios::tcdrain(self.fd());
            }
            Some(delay) => {
                let mut written = 0;
                while written < data.len() {
                    match unistd::write(self.fd(), &data[written..written + 1]) {
                        Ok(0) => continue,
                        Ok(_) => written += 1,
                        Err(Errno::EINTR) => {
                            std::thread::sleep(delay);
                            continue;
                        }
                        Err(errno) => return Err(Error::Write { errno, written }),
                    }
                    if written < data.len() {
                        // Push the byte onto the wire before pausing, so the
                        // delay really is line idle time.
                        let _ = termios::tcdrain(self.fd());
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        Ok(())
    }

    /// Snapshot read: one logical attempt returning up to `count` bytes.
    ///
    /// No queued data is not an error — the result is simply empty.
    /// Interrupted partial transfers are stitched into a single contiguous
    /// result before returning; real failures propagate immediately.
    pub fn read(&self, count: usize) -> Result<Vec<u8>> {
        io::read_available(self.fd(), count).map_err(Error::Io)
    }

    /// Read into a caller-owned buffer.
    ///
    /// Without a token this is a single snapshot attempt. With a token the
    /// call blocks until the port is readable or the token is signalled;
    /// cancellation yields `Error::Cancelled`, distinct from any I/O
    /// failure, and leaves the port open and reusable.
    pub fn read_into(&self, buf: &mut [u8], token: Option<&CancelToken>) -> Result<usize> {
        if let Some(token) = token {
            self.wait_or_cancel(token)?;
        }
        loop {
            match unistd::read(self.fd().as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Io(errno)),
            }
        }
    }

    /// Blocking snapshot read: wait for readability or cancellation, then
    /// assemble up to `count` bytes exactly like `read`.
    pub fn read_blocking(&self, count: usize, token: &CancelToken) -> Result<Vec<u8>> {
        self.wait_or_cancel(token)?;
        io::read_available(self.fd(), count).map_err(Error::Io)
    }

    fn wait_or_cancel(&self, token: &CancelToken) -> Result<()> {
        match io::wait_readable(self.fd(), token.wait_fd()) {
            Ok(WaitOutcome::PortReady { .. }) => Ok(()),
            Ok(WaitOutcome::Cancelled) => {
                // Consume the wake so the token can arm a later wait.
                token.drain();
                Err(Error::Cancelled)
            }
            Err(errno) => Err(Error::Io(errno)),
        }
    }
}
