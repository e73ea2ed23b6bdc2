// src/error.rs
//
// Error taxonomy for the transport core.
// Every OS failure carries the originating errno. Interrupted syscalls
// (EINTR) are retried internally and never surface here, except from the
// multiplexed cancellable wait, which is the designated interruption point.

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The device could not be opened (missing node, permission, busy).
    #[error("failed to open serial device: {0}")]
    Open(Errno),

    /// A port parameter could not be translated or applied.
    #[error("invalid port configuration: {0}")]
    Config(#[from] ConfigError),

    /// An OS-level I/O failure outside the write paths.
    #[error("serial I/O failed: {0}")]
    Io(Errno),

    /// A write failed after `written` bytes had already been accepted.
    /// The count is exact: everything before it reached the descriptor.
    #[error("write failed after {written} bytes: {errno}")]
    Write { errno: Errno, written: usize },

    /// A blocking wait was unblocked through its cancellation token.
    #[error("blocking operation was cancelled")]
    Cancelled,

    /// Zero-length writes are rejected before any syscall is issued;
    /// `write(2)` with a zero count has undefined behaviour on ttys.
    #[error("zero-length write is not permitted")]
    EmptyWrite,

    /// The transfer length would exceed the vectored-I/O segment limit.
    #[error("transfer length exceeds the vectored I/O segment limit")]
    InvalidLength,

    /// Allocation failure or a full registry table.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Worker thread creation, handshake, or join failure.
    #[error("worker thread failure: {0}")]
    Thread(String),

    /// The operation exists but this platform cannot perform it.
    #[error("operation not supported on this platform")]
    NotSupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A standard baud value with no termios constant on this platform.
    /// Deliberately an error rather than a silent clamp; callers that need
    /// such a rate should request it as `Baud::Custom`.
    #[error("baud rate {0} has no termios mapping on this platform")]
    UnsupportedBaud(u32),

    /// Parity-error marking was requested while parity checking is off.
    #[error("parity-error marking requires parity to be enabled")]
    ParityNotEnabled,

    /// Mark/space parity needs CMSPAR, which this platform lacks.
    #[error("mark/space parity is not supported on this platform")]
    MarkSpaceParity,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Errno values that indicate the device has already gone away. Swallowed
/// only on best-effort teardown paths (output drain, exclusivity release,
/// final close); everywhere else they propagate like any other failure.
pub(crate) fn is_benign_teardown_errno(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENXIO | Errno::ENOTTY | Errno::EBADF | Errno::ENODEV
    )
}

/// Map a `std::io::Error` from the open path to the originating errno.
pub(crate) fn open_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_teardown_classification() {
        assert!(is_benign_teardown_errno(Errno::ENXIO));
        assert!(is_benign_teardown_errno(Errno::ENOTTY));
        assert!(is_benign_teardown_errno(Errno::EBADF));
        assert!(is_benign_teardown_errno(Errno::ENODEV));
        assert!(!is_benign_teardown_errno(Errno::EIO));
        assert!(!is_benign_teardown_errno(Errno::EINTR));
        assert!(!is_benign_teardown_errno(Errno::EACCES));
    }

    #[test]
    fn test_write_error_reports_accepted_count() {
        let err = Error::Write {
            errno: Errno::EIO,
            written: 42,
        };
        assert!(err.to_string().contains("42"));
    }
}
