// src/io/vectored.rs
//
// Large-transfer strategy.
//
// Transfers at or below the segment size use the plain read/write path;
// larger ones are carved into fixed-size segments and submitted as one
// vectored syscall. Partial vectored transfers advance a cursor over the
// segment plan instead of recomputing chunk boundaries, and the transfer
// falls back to the scalar path once the remainder fits in one segment.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::AsRawFd;
use std::ops::Range;

use nix::errno::Errno;
use nix::sys::termios;
use nix::sys::uio::{readv, writev};
use nix::unistd;

use crate::error::{Error, Result};
use crate::io::{MAX_VECTOR_SEGMENTS, VECTOR_SEGMENT_BYTES};
use crate::port::SerialPort;

// ============================================================================
// Segment plan
// ============================================================================

/// Cursor over a buffer carved into VECTOR_SEGMENT_BYTES chunks.
///
/// The plan is built once for the full transfer; every partial completion
/// moves the cursor forward and the remaining chunk ranges are derived from
/// it, so no boundary is ever recomputed by hand.
pub(crate) struct SegmentPlan {
    len: usize,
    cursor: usize,
}

impl SegmentPlan {
    pub(crate) fn new(len: usize) -> Result<Self> {
        Self::check(len)?;
        Ok(SegmentPlan { len, cursor: 0 })
    }

    /// Reject lengths that would need more than the segment cap.
    pub(crate) fn check(len: usize) -> Result<()> {
        if len.div_ceil(VECTOR_SEGMENT_BYTES) > MAX_VECTOR_SEGMENTS {
            return Err(Error::InvalidLength);
        }
        Ok(())
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.len);
    }

    /// Chunk ranges covering the unfinished remainder: full segments plus a
    /// remainder-sized tail.
    pub(crate) fn chunk_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.remaining().div_ceil(VECTOR_SEGMENT_BYTES));
        let mut start = self.cursor;
        while start < self.len {
            let end = (start + VECTOR_SEGMENT_BYTES).min(self.len);
            ranges.push(start..end);
            start = end;
        }
        ranges
    }
}

// ============================================================================
// Direct transfers
// ============================================================================

impl SerialPort {
    /// Read into `buf` with the large-transfer strategy. Returns the number
    /// of bytes the single successful transfer produced; zero means no data
    /// was queued.
    pub fn read_direct(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if buf.len() <= VECTOR_SEGMENT_BYTES {
            loop {
                match unistd::read(self.fd().as_raw_fd(), buf) {
                    Ok(n) => return Ok(n),
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(Error::Io(errno)),
                }
            }
        }

        SegmentPlan::check(buf.len())?;
        loop {
            let mut iov: Vec<IoSliceMut<'_>> = buf
                .chunks_mut(VECTOR_SEGMENT_BYTES)
                .map(IoSliceMut::new)
                .collect();
            match readv(self.fd(), &mut iov) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Io(errno)),
            }
        }
    }

    /// Write all of `data` with the large-transfer strategy, draining after
    /// each completed burst so unflushed in-flight data stays bounded.
    /// Returns the total byte count on success; fatal errors carry the
    /// count accepted before the failure.
    pub fn write_direct(&self, data: &[u8]) -> Result<usize> {
        let mut written = 0;

        if data.len() <= VECTOR_SEGMENT_BYTES {
            self.write_span(data, &mut written)?;
            return Ok(written);
        }

        let mut plan = SegmentPlan::new(data.len())?;
        while plan.remaining() > 0 {
            if plan.remaining() <= VECTOR_SEGMENT_BYTES {
                // Remainder fits one segment: no reason to pay for iovec
                // bookkeeping any longer.
                self.write_span(&data[plan.cursor()..], &mut written)?;
                break;
            }

            let ranges = plan.chunk_ranges();
            let iov: Vec<IoSlice<'_>> = ranges
                .iter()
                .map(|r| IoSlice::new(&data[r.clone()]))
                .collect();
            match writev(self.fd(), &iov) {
                Ok(0) => continue,
                Ok(n) => {
                    plan.advance(n);
                    written += n;
                    let _ = termios::tcdrain(self.fd());
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Write { errno, written }),
            }
        }

        Ok(written)
    }

    /// Scalar write loop shared by the sub-threshold path and the vectored
    /// fallback; drains after every accepted burst.
    fn write_span(&self, buf: &[u8], written: &mut usize) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            match unistd::write(self.fd(), &buf[off..]) {
                Ok(0) => continue,
                Ok(n) => {
                    off += n;
                    *written += n;
                    let _ = termios::tcdrain(self.fd());
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(Error::Write {
                        errno,
                        written: *written,
                    })
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
