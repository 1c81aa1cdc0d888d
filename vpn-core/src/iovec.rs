//! Partial-I/O helpers.
//!
//! `readv`/`writev` (and plain `read`/`write`) are free to transfer fewer
//! bytes than requested, including on connected TCP-like streams under
//! memory pressure. These helpers retry until the requested byte count has
//! been transferred in full, or an error or zero-length transfer ends the
//! attempt.

use crate::error::IoVecError;
use libc::iovec;
use std::os::fd::RawFd;

type IovOp = unsafe extern "C" fn(RawFd, *const iovec, i32) -> isize;

/// Retries `op` over `iov`, advancing past fully consumed entries and
/// shrinking the entry a short transfer stopped in, until `expected` bytes
/// have moved in total. The iovec array is restored to its original values
/// before returning, so the caller can reuse it.
fn full_iov_work(op: IovOp, fd: RawFd, iov: &mut [iovec], expected: usize) -> Result<(), IoVecError> {
    if expected == 0 {
        return Ok(());
    }

    let res = unsafe { op(fd, iov.as_ptr(), iov.len() as i32) };
    if res < 0 {
        return Err(IoVecError::Io(std::io::Error::last_os_error()));
    }
    let done = res as usize;
    if done == 0 {
        return Err(IoVecError::NoProgress { expected, handled: 0 });
    }
    if done == expected {
        return Ok(());
    }

    let mut skip = done;
    let mut start = 0;
    while iov[start].iov_len <= skip {
        skip -= iov[start].iov_len;
        start += 1;
    }

    let orig_base = iov[start].iov_base;
    let orig_len = iov[start].iov_len;
    iov[start].iov_base = unsafe { (orig_base as *mut u8).add(skip) as *mut _ };
    iov[start].iov_len = orig_len - skip;

    let result = full_iov_work(op, fd, &mut iov[start..], expected - done)
        .map_err(|e| match e {
            IoVecError::NoProgress { handled, .. } => IoVecError::NoProgress {
                expected,
                handled: done + handled,
            },
            other => other,
        });

    iov[start].iov_base = orig_base;
    iov[start].iov_len = orig_len;

    result
}

pub fn full_readv(fd: RawFd, iov: &mut [iovec], expected: usize) -> Result<(), IoVecError> {
    full_iov_work(libc::readv, fd, iov, expected)
}

pub fn full_writev(fd: RawFd, iov: &mut [iovec], expected: usize) -> Result<(), IoVecError> {
    full_iov_work(libc::writev, fd, iov, expected)
}

/// Loops `write(2)` until all of `buf` has been written.
pub fn full_write(fd: RawFd, mut buf: &[u8]) -> Result<(), IoVecError> {
    let expected = buf.len();
    let mut handled = 0usize;
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if n < 0 {
            return Err(IoVecError::Io(std::io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(IoVecError::NoProgress { expected, handled });
        }
        let n = n as usize;
        handled += n;
        buf = &buf[n..];
    }
    Ok(())
}

/// Loops `read(2)` until `buf` has been filled completely.
pub fn full_read(fd: RawFd, mut buf: &mut [u8]) -> Result<(), IoVecError> {
    let expected = buf.len();
    let mut handled = 0usize;
    while !buf.is_empty() {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(IoVecError::Io(std::io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(IoVecError::NoProgress { expected, handled });
        }
        let n = n as usize;
        handled += n;
        buf = &mut buf[n..];
    }
    Ok(())
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

    #[test]
    fn full_write_then_full_read_round_trip() {
        let (read_fd, write_fd) = make_pipe();
        let payload = b"the quick brown fox jumps over the lazy dog";

        full_write(write_fd, payload).unwrap();
        let mut out = vec![0u8; payload.len()];
        full_read(read_fd, &mut out).unwrap();
        assert_eq!(&out, payload);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn full_readv_restores_iovec_array() {
        let (read_fd, write_fd) = make_pipe();
        let payload = b"0123456789abcdef";
        unsafe {
            libc::write(write_fd, payload.as_ptr() as *const _, payload.len());
        }

        let mut first = vec![0u8; 6];
        let mut second = vec![0u8; payload.len() - 6];
        let mut iov = [
            iovec {
                iov_base: first.as_mut_ptr() as *mut _,
                iov_len: first.len(),
            },
            iovec {
                iov_base: second.as_mut_ptr() as *mut _,
                iov_len: second.len(),
            },
        ];
        let original_len_0 = iov[0].iov_len;
        let original_base_0 = iov[0].iov_base;

        full_readv(read_fd, &mut iov, payload.len()).unwrap();

        assert_eq!(iov[0].iov_len, original_len_0);
        assert_eq!(iov[0].iov_base, original_base_0);
        assert_eq!(&first[..], &payload[..6]);
        assert_eq!(&second[..], &payload[6..]);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
