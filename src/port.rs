// src/port.rs
//
// Serial port handle: open/close lifecycle and the ioctl-level control
// surface (modem lines, break, queue levels, buffer flush).
//
// A SerialPort owns its descriptor. Dropping the handle closes the
// descriptor; calling close() additionally drains pending output and
// releases exclusivity the way an orderly shutdown should.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::termios::{self, FlushArg};
use serde::Serialize;

use crate::error::{is_benign_teardown_errno, open_errno, ConfigError, Error, Result};

// ============================================================================
// ioctl bindings
// ============================================================================

#[cfg(any(target_os = "linux", target_os = "macos"))]
nix::ioctl_none_bad!(tiocexcl, libc::TIOCEXCL);
#[cfg(any(target_os = "linux", target_os = "macos"))]
nix::ioctl_none_bad!(tiocnxcl, libc::TIOCNXCL);
nix::ioctl_read_bad!(tiocmget, libc::TIOCMGET, libc::c_int);
nix::ioctl_write_ptr_bad!(tiocmset, libc::TIOCMSET, libc::c_int);
nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);
nix::ioctl_read_bad!(tiocoutq, libc::TIOCOUTQ, libc::c_int);
nix::ioctl_none_bad!(tiocsbrk, libc::TIOCSBRK);
nix::ioctl_none_bad!(tioccbrk, libc::TIOCCBRK);

/// TIOCGICOUNT is absent from libc; asm-generic value.
#[cfg(target_os = "linux")]
const TIOCGICOUNT_REQ: libc::c_ulong = 0x545D;

#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SerialIcounter {
    cts: libc::c_int,
    dsr: libc::c_int,
    rng: libc::c_int,
    dcd: libc::c_int,
    rx: libc::c_int,
    tx: libc::c_int,
    frame: libc::c_int,
    overrun: libc::c_int,
    parity: libc::c_int,
    brk: libc::c_int,
    buf_overrun: libc::c_int,
    reserved: [libc::c_int; 9],
}

#[cfg(target_os = "linux")]
nix::ioctl_read_bad!(tiocgicount, TIOCGICOUNT_REQ, SerialIcounter);

// ============================================================================
// Types
// ============================================================================

/// Which directions the descriptor is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Snapshot of the modem/control lines. `true` means asserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LineStatus {
    pub cts: bool,
    pub dsr: bool,
    pub dcd: bool,
    pub ri: bool,
    pub rts: bool,
    pub dtr: bool,
}

/// Bytes currently queued in the driver on each side of the port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QueuedBytes {
    pub input: u32,
    pub output: u32,
}

/// Per-line interrupt statistics from the UART driver.
#[cfg(target_os = "linux")]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InterruptCounts {
    pub cts: u32,
    pub dsr: u32,
    pub ring: u32,
    pub dcd: u32,
    pub rx: u32,
    pub tx: u32,
    pub frame: u32,
    pub overrun: u32,
    pub parity: u32,
    pub brk: u32,
    pub buf_overrun: u32,
}

/// An open serial device. Exclusively owned by the opening caller; all
/// blocking I/O suspends only the calling thread.
pub struct SerialPort {
    fd: OwnedFd,
    path: PathBuf,
    access: Access,
    exclusive: bool,
}

// ============================================================================
// Open / close
// ============================================================================

impl SerialPort {
    /// Open a tty-style device.
    ///
    /// The open itself is performed non-blocking and non-controlling so a
    /// modem waiting for carrier cannot hang the caller; blocking mode is
    /// restored immediately afterwards (read behaviour is then governed by
    /// VMIN/VTIME). With `exclusive`, the descriptor takes the kernel
    /// exclusivity lock so other processes cannot open the device; on
    /// platforms without that lock the request fails rather than being
    /// silently ignored.
    pub fn open(path: impl AsRef<Path>, access: Access, exclusive: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (read, write) = match access {
            Access::ReadOnly => (true, false),
            Access::WriteOnly => (false, true),
            Access::ReadWrite => (true, true),
        };

        let file = OpenOptions::new()
            .read(read)
            .write(write)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| Error::Open(open_errno(&e)))?;
        let fd: OwnedFd = file.into();

        // Restore blocking behaviour; O_NONBLOCK was only there to defeat
        // the carrier wait during open.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::Open(Errno::last()));
        }
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(Error::Open(Errno::last()));
        }

        if exclusive {
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            {
                let locked = unsafe { tiocexcl(fd.as_raw_fd()) };
                locked.map_err(Error::Open)?;
            }
            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            return Err(Error::NotSupported);
        }

        tlog!(
            "[port] Opened {} ({:?}{})",
            path.display(),
            access,
            if exclusive { ", exclusive" } else { "" }
        );

        Ok(SerialPort {
            fd,
            path,
            access,
            exclusive,
        })
    }

    /// Orderly close: drain pending output (best effort), release the
    /// exclusivity lock (device-gone errors ignored), then close the
    /// descriptor, retrying transparently when a signal interrupts the
    /// close itself.
    pub fn close(self) -> Result<()> {
        let SerialPort {
            fd,
            path,
            exclusive,
            ..
        } = self;

        // Flush whatever is still queued towards the receiver; a dead
        // device makes this fail and that is fine during teardown.
        let _ = termios::tcdrain(&fd);

        if exclusive {
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            if let Err(errno) = unsafe { tiocnxcl(fd.as_raw_fd()) } {
                if !is_benign_teardown_errno(errno) {
                    return Err(Error::Io(errno));
                }
            }
        }

        let raw = fd.into_raw_fd();
        loop {
            let ret = unsafe { libc::close(raw) };
            if ret == 0 {
                break;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno if is_benign_teardown_errno(errno) => break,
                errno => return Err(Error::Io(errno)),
            }
        }

        tlog!("[port] Closed {}", path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SerialPort {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// ============================================================================
// Control lines and driver queues
// ============================================================================

/// TIOCMGET against a raw descriptor; shared with the event worker thread,
/// which holds no SerialPort.
pub(crate) fn read_line_status(fd: RawFd) -> std::result::Result<LineStatus, Errno> {
    let mut bits: libc::c_int = 0;
    let res = unsafe { tiocmget(fd, &mut bits) };
    res?;
    Ok(LineStatus {
        cts: bits & libc::TIOCM_CTS != 0,
        dsr: bits & libc::TIOCM_DSR != 0,
        dcd: bits & libc::TIOCM_CAR != 0,
        ri: bits & libc::TIOCM_RNG != 0,
        rts: bits & libc::TIOCM_RTS != 0,
        dtr: bits & libc::TIOCM_DTR != 0,
    })
}

impl SerialPort {
    /// Snapshot of the modem/control lines.
    pub fn line_status(&self) -> Result<LineStatus> {
        read_line_status(self.as_raw_fd()).map_err(Error::Io)
    }

    /// Drive the RTS line high or low.
    pub fn set_rts(&self, asserted: bool) -> Result<()> {
        self.set_modem_bit(libc::TIOCM_RTS, asserted)
    }

    /// Drive the DTR line high or low.
    pub fn set_dtr(&self, asserted: bool) -> Result<()> {
        self.set_modem_bit(libc::TIOCM_DTR, asserted)
    }

    fn set_modem_bit(&self, bit: libc::c_int, asserted: bool) -> Result<()> {
        let mut bits: libc::c_int = 0;
        let read = unsafe { tiocmget(self.as_raw_fd(), &mut bits) };
        read.map_err(Error::Io)?;
        if asserted {
            bits |= bit;
        } else {
            bits &= !bit;
        }
        let set = unsafe { tiocmset(self.as_raw_fd(), &bits) };
        set.map_err(Error::Io)?;
        Ok(())
    }

    /// Hold the line in the space condition for `duration` (an EIA-232
    /// break), then release it.
    pub fn send_break(&self, duration: Duration) -> Result<()> {
        let set = unsafe { tiocsbrk(self.as_raw_fd()) };
        set.map_err(Error::Io)?;
        std::thread::sleep(duration);
        let clear = unsafe { tioccbrk(self.as_raw_fd()) };
        clear.map_err(Error::Io)?;
        Ok(())
    }

    /// Discard queued data: received-but-unread (`rx`), written-but-unsent
    /// (`tx`), or both.
    pub fn clear_buffers(&self, rx: bool, tx: bool) -> Result<()> {
        let selector = match (rx, tx) {
            (true, true) => FlushArg::TCIOFLUSH,
            (true, false) => FlushArg::TCIFLUSH,
            (false, true) => FlushArg::TCOFLUSH,
            (false, false) => {
                return Err(Error::Config(ConfigError::InvalidParameter(
                    "select at least one buffer to clear",
                )))
            }
        };
        termios::tcflush(self.fd(), selector).map_err(Error::Io)
    }

    /// Bytes currently queued in the driver, per direction.
    pub fn queued_bytes(&self) -> Result<QueuedBytes> {
        let mut input: libc::c_int = 0;
        let mut output: libc::c_int = 0;
        let res = unsafe { fionread(self.as_raw_fd(), &mut input) };
        res.map_err(Error::Io)?;
        let res = unsafe { tiocoutq(self.as_raw_fd(), &mut output) };
        res.map_err(Error::Io)?;
        Ok(QueuedBytes {
            input: input.max(0) as u32,
            output: output.max(0) as u32,
        })
    }

    /// Per-line interrupt counters from the UART driver. Only drivers with
    /// a real interrupt handler fill these in.
    #[cfg(target_os = "linux")]
    pub fn interrupt_counts(&self) -> Result<InterruptCounts> {
        let mut raw = SerialIcounter::default();
        let res = unsafe { tiocgicount(self.as_raw_fd(), &mut raw) };
        res.map_err(Error::Io)?;
        Ok(InterruptCounts {
            cts: raw.cts.max(0) as u32,
            dsr: raw.dsr.max(0) as u32,
            ring: raw.rng.max(0) as u32,
            dcd: raw.dcd.max(0) as u32,
            rx: raw.rx.max(0) as u32,
            tx: raw.tx.max(0) as u32,
            frame: raw.frame.max(0) as u32,
            overrun: raw.overrun.max(0) as u32,
            parity: raw.parity.max(0) as u32,
            brk: raw.brk.max(0) as u32,
            buf_overrun: raw.buf_overrun.max(0) as u32,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nix::pty::openpty;

    /// Open a pty pair and wrap the slave side in a SerialPort through the
    /// public open path. Returns the port plus the master fd the test
    /// drives the other end with.
    pub(crate) fn open_pty_port() -> (SerialPort, OwnedFd) {
        let pty = openpty(None, None).expect("openpty");
        let path = nix::unistd::ttyname(&pty.slave).expect("ttyname");
        let port = SerialPort::open(&path, Access::ReadWrite, false).expect("open pty slave");
        (port, pty.master)
    }

    #[test]
    fn test_open_missing_device_fails_with_errno() {
        match SerialPort::open("/dev/does-not-exist-portlink", Access::ReadWrite, false) {
            Err(Error::Open(errno)) => assert_eq!(errno, Errno::ENOENT),
            other => panic!("expected Open(ENOENT), got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_open_and_close_pty() {
        let (port, _master) = open_pty_port();
        assert!(port.as_raw_fd() >= 0);
        port.close().expect("close");
    }

    #[test]
    fn test_exclusive_open_blocks_second_open() {
        let pty = openpty(None, None).expect("openpty");
        let path = nix::unistd::ttyname(&pty.slave).expect("ttyname");
        let port = SerialPort::open(&path, Access::ReadWrite, true).expect("exclusive open");

        // TIOCEXCL does not apply to processes with CAP_SYS_ADMIN, so the
        // lock-out half of the contract is only observable unprivileged.
        if unsafe { libc::geteuid() } != 0 {
            match SerialPort::open(&path, Access::ReadWrite, false) {
                Err(Error::Open(errno)) => assert_eq!(errno, Errno::EBUSY),
                other => panic!("expected Open(EBUSY), got {:?}", other.map(|_| ())),
            }
        }

        // Closing releases the lock and the device becomes openable again.
        port.close().expect("close");
        let reopened = SerialPort::open(&path, Access::ReadWrite, false).expect("reopen");
        reopened.close().expect("close reopened");
    }

    #[test]
    fn test_queued_bytes_sees_pending_input() {
        let (port, master) = open_pty_port();
        nix::unistd::write(&master, b"HELLO").expect("write master");
        // The kernel moves bytes to the slave queue asynchronously.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let queued = port.queued_bytes().expect("queued_bytes");
        assert!(queued.input >= 5, "expected >=5 queued, got {}", queued.input);
    }

    #[test]
    fn test_clear_buffers_requires_a_selection() {
        let (port, _master) = open_pty_port();
        assert!(matches!(
            port.clear_buffers(false, false),
            Err(Error::Config(ConfigError::InvalidParameter(_)))
        ));
        port.clear_buffers(true, true).expect("flush both");
    }

    #[test]
    fn test_clear_buffers_discards_pending_input() {
        let (port, master) = open_pty_port();
        nix::unistd::write(&master, b"stale").expect("write master");
        std::thread::sleep(std::time::Duration::from_millis(50));
        port.clear_buffers(true, false).expect("flush rx");
        let queued = port.queued_bytes().expect("queued_bytes");
        assert_eq!(queued.input, 0);
    }
}
