//! The client transmission loop.
//!
//! Two revisions live side by side. [`client_transmission_loop`] is the
//! current, batched two-channel form: a `recvmmsg`/`sendmmsg` pair moves
//! whole batches of L2TP datagrams across two parallel byte streams (one
//! carrying length prefixes, one carrying payloads) feeding an `ssh`-like
//! subprocess. [`RingClientLoop`] is the earlier single-stream, per-frame
//! revision built directly on the circular buffer: the tap/socket side reads
//! one whole frame per `read()` and blocks until it's written out, while the
//! ssh-stream side is the one direction that needs the ring, since it
//! arrives as a continuous flow with no guarantee of landing on frame
//! boundaries.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use vpn_core::framing;
use vpn_core::iovec::{full_readv, full_write, full_writev};
use vpn_core::ring::Ring;
use vpn_core::status;
use vpn_core::tunables::LENGTH_SIZE;
use vpn_core::{batch, signal, LoopError, LoopOutcome, Tunables};

const SOCK_TOKEN: Token = Token(0);
const LENGTHS_STDOUT_TOKEN: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Runs the batched client loop until SIGINT or an unrecoverable error.
///
/// `sock_fd` is the local TAP or L2TP UDP socket; the four stream fds are
/// the write/read ends of the subprocess carrying the tunnel (lengths and
/// packets travel as two parallel streams so a length prefix never has to
/// be reassembled out of a payload byte range).
pub fn client_transmission_loop(
    lengths_stdin: RawFd,
    lengths_stdout: RawFd,
    packets_stdin: RawFd,
    packets_stdout: RawFd,
    sock_fd: RawFd,
    tunables: Tunables,
) -> LoopOutcome {
    status::begin();
    signal::redirect_sigint();

    match run(lengths_stdin, lengths_stdout, packets_stdin, packets_stdout, sock_fd, &tunables) {
        Ok(()) => LoopOutcome::Abort,
        Err(err) => {
            warn!(error = %err, "client transmission loop exiting");
            err.outcome()
        }
    }
}

fn run(
    lengths_stdin: RawFd,
    lengths_stdout: RawFd,
    packets_stdin: RawFd,
    packets_stdout: RawFd,
    sock_fd: RawFd,
    tunables: &Tunables,
) -> Result<(), LoopError> {
    let mut poll = Poll::new().map_err(|e| LoopError::fatal("poll_new", e))?;
    let mut events = Events::with_capacity(2);

    poll.registry()
        .register(&mut SourceFd(&sock_fd), SOCK_TOKEN, Interest::READABLE)
        .map_err(|e| LoopError::fatal("poll_register_sock", e))?;
    poll.registry()
        .register(&mut SourceFd(&lengths_stdout), LENGTHS_STDOUT_TOKEN, Interest::READABLE)
        .map_err(|e| LoopError::fatal("poll_register_lengths_stdout", e))?;

    let mut io = batch::IoBuffers::new(tunables);
    let mut lengths_buf = vec![0u8; tunables.lengths_staging_size()];

    loop {
        if !status::STATUS.is_running() {
            return Err(LoopError::fatal("signal", io::Error::new(io::ErrorKind::Interrupted, "SIGINT")));
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(LoopError::fatal("poll", e)),
        }

        for event in events.iter() {
            match event.token() {
                SOCK_TOKEN => sock_to_streams(sock_fd, lengths_stdin, packets_stdin, &mut io)?,
                LENGTHS_STDOUT_TOKEN => streams_to_sock(
                    lengths_stdout,
                    packets_stdout,
                    sock_fd,
                    &mut io,
                    &mut lengths_buf,
                    tunables,
                )?,
                _ => unreachable!("unregistered token"),
            }
        }
    }
}

/// Step 3: drain `sock_fd` with one `recvmmsg`, stage the batch's lengths
/// and payloads, then push both onto the two stream fds. Any failure here
/// is transient -- the caller should reinit the channel, not abort the
/// process.
fn sock_to_streams(
    sock_fd: RawFd,
    lengths_stdin: RawFd,
    packets_stdin: RawFd,
    io: &mut batch::IoBuffers,
) -> Result<(), LoopError> {
    let received = batch::recv_batch(sock_fd, io).map_err(|e| LoopError::transient("sock_fd", e.into_io()))?;
    if received == 0 {
        return Ok(());
    }
    debug!(received, "batch received from sock_fd");

    let mut lengths_out = vec![0u8; received * 2];
    let mut total = 0usize;
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(received);
    for i in 0..received {
        let len = io.len(i);
        lengths_out[i * 2..i * 2 + 2].copy_from_slice(&framing::encode_len(len));
        total += len;
        iovecs.push(libc::iovec {
            iov_base: io.payload_mut(i).as_mut_ptr() as *mut _,
            iov_len: len,
        });
    }

    full_write(lengths_stdin, &lengths_out).map_err(|e| LoopError::transient("lengths_stdin", e.into_io()))?;
    full_writev(packets_stdin, &mut iovecs, total).map_err(|e| LoopError::transient("packets_stdin", e.into_io()))?;
    Ok(())
}

/// Step 4: read a whole number of length prefixes from `lengths_stdout`
/// (retrying on the "highly unusual" odd byte count), pull the matching
/// payload bytes from `packets_stdout`, and send the reassembled batch on
/// `sock_fd` in one `sendmmsg`. A short send is fatal.
fn streams_to_sock(
    lengths_stdout: RawFd,
    packets_stdout: RawFd,
    sock_fd: RawFd,
    io: &mut batch::IoBuffers,
    lengths_buf: &mut [u8],
    tunables: &Tunables,
) -> Result<(), LoopError> {
    let n = read_lengths_batch(lengths_stdout, lengths_buf)?;
    let frame_count = n / 2;
    if frame_count == 0 {
        return Ok(());
    }

    let mut total = 0usize;
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(frame_count);
    for i in 0..frame_count {
        let len_bytes = [lengths_buf[i * 2], lengths_buf[i * 2 + 1]];
        let len = framing::decode_len(len_bytes, tunables.max_payload)?;
        io.set_len(i, len);
        total += len;
        iovecs.push(libc::iovec {
            iov_base: io.payload_mut(i).as_mut_ptr() as *mut _,
            iov_len: len,
        });
    }

    full_readv(packets_stdout, &mut iovecs, total).map_err(|e| LoopError::transient("packets_stdout", e.into_io()))?;

    let sent = batch::send_batch(sock_fd, io, frame_count).map_err(|e| LoopError::fatal_batch("sock_fd", e))?;
    debug!(sent, "batch sent to sock_fd");
    Ok(())
}

/// Reads from `lengths_stdout` until at least one complete length prefix is
/// available, continuing past an odd byte count instead of treating it as
/// an error.
fn read_lengths_batch(fd: RawFd, buf: &mut [u8]) -> Result<usize, LoopError> {
    let mut total = 0usize;
    loop {
        let n = unsafe { libc::read(fd, buf[total..].as_mut_ptr() as *mut _, buf.len() - total) };
        if n < 0 {
            return Err(LoopError::transient("lengths_stdout", io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(LoopError::transient(
                "lengths_stdout",
                io::Error::new(io::ErrorKind::UnexpectedEof, "lengths stream closed"),
            ));
        }
        total += n as usize;
        if total % 2 == 0 {
            return Ok(total);
        }
        warn!(total, "odd byte count on lengths stream, continuing read");
    }
}

const TAP_TOKEN: Token = Token(0);
const SSH_TOKEN: Token = Token(1);

/// The earlier ring-based client loop. The tap/socket side reads one whole
/// frame per syscall and writes it out fully before moving on -- no ring
/// needed there. The ssh-stream side arrives as a continuous flow with no
/// guarantee of landing on frame boundaries, so it's the one direction
/// backed by a [`Ring`].
pub struct RingClientLoop {
    ring: Ring,
}

impl RingClientLoop {
    pub fn new(tunables: &Tunables) -> Self {
        RingClientLoop { ring: Ring::new(tunables.ring_capacity) }
    }

    /// Runs until SIGINT or an unrecoverable error. `ssh_stdin`/`ssh_stdout`
    /// are the combined length+payload stream of the earlier revision;
    /// `tap_fd` is the local TAP device (or, for the endpoint loop, the
    /// local L2TP socket).
    pub fn run(&mut self, ssh_stdin: RawFd, ssh_stdout: RawFd, tap_fd: RawFd, tunables: &Tunables) -> LoopOutcome {
        status::begin();
        signal::redirect_sigint();

        match self.run_inner(ssh_stdin, ssh_stdout, tap_fd, tunables) {
            Ok(()) => LoopOutcome::Abort,
            Err(err) => {
                warn!(error = %err, "ring client loop exiting");
                err.outcome()
            }
        }
    }

    fn run_inner(&mut self, ssh_stdin: RawFd, ssh_stdout: RawFd, tap_fd: RawFd, tunables: &Tunables) -> Result<(), LoopError> {
        let mut poll = Poll::new().map_err(|e| LoopError::fatal("poll_new", e))?;
        let mut events = Events::with_capacity(2);
        poll.registry()
            .register(&mut SourceFd(&tap_fd), TAP_TOKEN, Interest::READABLE)
            .map_err(|e| LoopError::fatal("poll_register_tap", e))?;
        poll.registry()
            .register(&mut SourceFd(&ssh_stdout), SSH_TOKEN, Interest::READABLE)
            .map_err(|e| LoopError::fatal("poll_register_ssh", e))?;

        let mut frame_buf = vec![0u8; LENGTH_SIZE + tunables.max_payload];

        loop {
            if !status::STATUS.is_running() {
                return Err(LoopError::fatal("signal", io::Error::new(io::ErrorKind::Interrupted, "SIGINT")));
            }

            match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LoopError::fatal("poll", e)),
            }

            for event in events.iter() {
                match event.token() {
                    TAP_TOKEN => self.handle_tap(tap_fd, ssh_stdin, &mut frame_buf, tunables)?,
                    SSH_TOKEN => self.handle_ssh(ssh_stdout, tap_fd)?,
                    _ => unreachable!("unregistered token"),
                }
            }
        }
    }

    /// One read() on the tap/socket side is one whole frame; prefix its
    /// length and write it out fully before returning. A tap read failure
    /// is fatal, matching the source (there is no degraded mode for "can't
    /// read the local interface anymore"); a write failure on the ssh
    /// stream is transient.
    fn handle_tap(&mut self, tap_fd: RawFd, ssh_stdin: RawFd, frame_buf: &mut [u8], tunables: &Tunables) -> Result<(), LoopError> {
        let n = unsafe {
            libc::read(tap_fd, frame_buf[2..].as_mut_ptr() as *mut _, tunables.max_payload)
        };
        if n < 1 {
            let source = if n == 0 {
                io::Error::new(io::ErrorKind::UnexpectedEof, "tap closed")
            } else {
                io::Error::last_os_error()
            };
            return Err(LoopError::fatal("tap_fd", source));
        }
        let n = n as usize;
        let prefix = framing::encode_len(n);
        frame_buf[0] = prefix[0];
        frame_buf[1] = prefix[1];
        full_write(ssh_stdin, &frame_buf[..2 + n]).map_err(|e| LoopError::transient("ssh_stdin", e.into_io()))
    }

    /// Fills the ring from the ssh stream and writes out every complete
    /// frame it now contains to the tap/socket side.
    fn handle_ssh(&mut self, ssh_stdout: RawFd, tap_fd: RawFd) -> Result<(), LoopError> {
        self.ring.fill(ssh_stdout).map_err(|e| LoopError::transient("ssh_stdout", e.into_io()))?;

        while self.ring.level() >= 2 {
            let packet_len = self.ring.peek_u16_be() as usize;
            if self.ring.level() < 2 + packet_len {
                break;
            }
            self.ring.pass(2);
            let flushed = self.ring.flush(packet_len, tap_fd).map_err(|e| LoopError::fatal("tap_fd", e.into_io()))?;
            debug!(flushed, "frame forwarded to tap");
        }
        Ok(())
    }
}
