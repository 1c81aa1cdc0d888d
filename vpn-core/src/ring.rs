//! A circular byte buffer backed by a single allocation, filled and flushed
//! through scatter/gather syscalls when the live region wraps around the end
//! of the backing slice.
//!
//! `fill_pos` is where the next byte read from a file descriptor lands;
//! `flush_pos` is where the next byte written out comes from. `level` is the
//! number of live bytes, kept alongside the two positions rather than
//! derived from them so that "full" and "empty" (both `fill_pos ==
//! flush_pos`) can be told apart.

use crate::error::RingError;
use libc::iovec;
use std::os::fd::RawFd;

pub struct Ring {
    buf: Box<[u8]>,
    level: usize,
    fill_pos: usize,
    flush_pos: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Ring {
            buf: vec![0u8; capacity].into_boxed_slice(),
            level: 0,
            fill_pos: 0,
            flush_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_empty(&self) -> bool {
        self.level == 0
    }

    pub fn is_full(&self) -> bool {
        self.level == self.buf.len()
    }

    pub fn available(&self) -> usize {
        self.buf.len() - self.level
    }

    pub fn has_room(&self, n: usize) -> bool {
        self.available() >= n
    }

    /// Reads from `fd` into the free region, issuing a two-segment `readv`
    /// when that region wraps past the end of the backing slice. Returns the
    /// number of bytes read; `Ok(0)` means the ring was already full.
    pub fn fill(&mut self, fd: RawFd) -> Result<usize, RingError> {
        let cap = self.buf.len();
        if self.is_full() {
            return Ok(0);
        }
        let base = self.buf.as_mut_ptr();
        let mut iovecs: [iovec; 2] = unsafe { std::mem::zeroed() };
        let mut n = 0usize;

        if self.fill_pos < self.flush_pos {
            iovecs[0] = iovec {
                iov_base: unsafe { base.add(self.fill_pos) } as *mut _,
                iov_len: self.flush_pos - self.fill_pos,
            };
            n = 1;
        } else {
            iovecs[n] = iovec {
                iov_base: unsafe { base.add(self.fill_pos) } as *mut _,
                iov_len: cap - self.fill_pos,
            };
            n += 1;
            if self.flush_pos > 0 {
                iovecs[n] = iovec {
                    iov_base: base as *mut _,
                    iov_len: self.flush_pos,
                };
                n += 1;
            }
        }

        let read = unsafe { libc::readv(fd, iovecs.as_ptr(), n as i32) };
        if read < 0 {
            return Err(RingError::Io(std::io::Error::last_os_error()));
        }
        if read == 0 {
            return Err(RingError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed while filling ring",
            )));
        }
        let read = read as usize;
        self.fill_pos = (self.fill_pos + read) % cap;
        self.level += read;
        Ok(read)
    }

    /// Writes `n` live bytes starting at `flush_pos` to `fd`, wrapping with a
    /// two-segment `writev` as needed. `n` must not exceed [`Ring::level`].
    pub fn flush(&mut self, n: usize, fd: RawFd) -> Result<usize, RingError> {
        assert!(n <= self.level, "flush of {n} exceeds live level {}", self.level);
        if n == 0 {
            return Ok(0);
        }
        let mut iovecs: [iovec; 2] = unsafe { std::mem::zeroed() };
        let count = self.build_flush_iovecs(n, &mut iovecs);

        let written = unsafe { libc::writev(fd, iovecs.as_ptr(), count as i32) };
        if written < 0 {
            return Err(RingError::Io(std::io::Error::last_os_error()));
        }
        let written = written as usize;
        self.advance_flush(written);
        Ok(written)
    }

    /// Builds the (one or two) iovecs describing the next `n` live bytes
    /// without performing I/O, for callers that batch several ring reads
    /// into one external `writev`/`sendmmsg` call. Does not advance
    /// `flush_pos`; pair with [`Ring::advance_flush`] once the caller's own
    /// I/O call reports how much was actually consumed.
    pub fn build_flush_iovecs(&self, n: usize, out: &mut [iovec; 2]) -> usize {
        assert!(n <= self.level);
        let cap = self.buf.len();
        let base = self.buf.as_ptr();

        if self.fill_pos > self.flush_pos || self.flush_pos + n <= cap {
            out[0] = iovec {
                iov_base: unsafe { base.add(self.flush_pos) } as *mut _,
                iov_len: n,
            };
            1
        } else {
            let first_len = cap - self.flush_pos;
            out[0] = iovec {
                iov_base: unsafe { base.add(self.flush_pos) } as *mut _,
                iov_len: first_len,
            };
            out[1] = iovec {
                iov_base: base as *mut _,
                iov_len: n - first_len,
            };
            2
        }
    }

    /// Advances `flush_pos` and shrinks `level` by `n` bytes, resetting both
    /// positions to zero once the ring drains completely.
    pub fn advance_flush(&mut self, n: usize) {
        assert!(n <= self.level);
        let cap = self.buf.len();
        self.flush_pos = (self.flush_pos + n) % cap;
        self.level -= n;
        if self.level == 0 {
            self.fill_pos = 0;
            self.flush_pos = 0;
        }
    }

    /// Reads the 2-byte big-endian value at `flush_pos` without consuming
    /// it. Caller must ensure at least 2 live bytes are present.
    pub fn peek_u16_be(&self) -> u16 {
        assert!(self.level >= 2, "peek_u16_be needs 2 live bytes, have {}", self.level);
        let cap = self.buf.len();
        let b0 = self.buf[self.flush_pos];
        let b1 = self.buf[(self.flush_pos + 1) % cap];
        u16::from_be_bytes([b0, b1])
    }

    /// Discards `n` live bytes from the front of the ring without copying
    /// them anywhere, advancing past data already handled out-of-band.
    pub fn pass(&mut self, n: usize) {
        self.advance_flush(n);
    }

    /// Appends one byte at `fill_pos`, wrapping as needed. Caller must
    /// ensure there is room.
    pub fn write_u8(&mut self, byte: u8) {
        assert!(self.has_room(1), "ring has no room for another byte");
        let cap = self.buf.len();
        self.buf[self.fill_pos] = byte;
        self.fill_pos = (self.fill_pos + 1) % cap;
        self.level += 1;
    }

    pub fn write_u16_be(&mut self, value: u16) {
        let bytes = value.to_be_bytes();
        self.write_u8(bytes[0]);
        self.write_u8(bytes[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn pipe_write(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
        assert_eq!(n as usize, data.len());
    }

    #[test]
    fn new_ring_is_empty() {
        let ring = Ring::new(16);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.available(), 16);
    }

    #[test]
    fn fill_and_flush_round_trip_through_pipes() {
        let (read_fd, write_fd) = make_pipe();
        let (drain_read, drain_write) = make_pipe();
        let mut ring = Ring::new(64);

        pipe_write(write_fd, b"hello world");
        let read = ring.fill(read_fd).unwrap();
        assert_eq!(read, 11);
        assert_eq!(ring.level(), 11);

        let written = ring.flush(11, drain_write).unwrap();
        assert_eq!(written, 11);
        assert!(ring.is_empty());

        let mut out = [0u8; 11];
        let n = unsafe { libc::read(drain_read, out.as_mut_ptr() as *mut _, 11) };
        assert_eq!(n as usize, 11);
        assert_eq!(&out, b"hello world");

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
            libc::close(drain_read);
            libc::close(drain_write);
        }
    }

    #[test]
    fn write_u16_be_straddling_wrap_peeks_correctly() {
        let mut ring = Ring::new(8);
        // Push the fill cursor to 7 so the next 2 bytes wrap around.
        for _ in 0..7 {
            ring.write_u8(0xAA);
        }
        ring.pass(7);
        assert!(ring.is_empty());
        assert_eq!(ring.fill_pos_for_test(), 7);

        ring.write_u16_be(0x1234);
        assert_eq!(ring.level(), 2);
        assert_eq!(ring.peek_u16_be(), 0x1234);
    }

    impl Ring {
        fn fill_pos_for_test(&self) -> usize {
            self.fill_pos
        }
    }

    #[test]
    fn pass_discards_without_copying() {
        let mut ring = Ring::new(16);
        ring.write_u16_be(0xBEEF);
        ring.write_u8(0x01);
        assert_eq!(ring.level(), 3);
        ring.pass(2);
        assert_eq!(ring.level(), 1);
    }
}
