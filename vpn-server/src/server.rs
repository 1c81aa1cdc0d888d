//! Server-side transmission loop.
//!
//! Two well-known descriptors carry the shared traffic: `SERVER_SOCK_FD`
//! accepts new client shell channels, `L2TP_SOCK_FD` is the one UDP socket
//! all clients' L2TP traffic is multiplexed over. Each connected client owns
//! an 8-descriptor block starting at a base equal to its L2TP session id;
//! this loop only ever touches four of those eight (`lengths_read`,
//! `lengths_write`, `packets_read`, `packets_write`), the rest being
//! orchestrator bookkeeping.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use indexmap::IndexSet;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use vpn_core::framing;
use vpn_core::iovec::{full_readv, full_write, full_writev};
use vpn_core::status;
use vpn_core::{batch, signal, LoopError, LoopOutcome, Tunables};

const SERVER_SOCK_FD: RawFd = 3;
const L2TP_SOCK_FD: RawFd = 4;
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Outcome of an accept attempt on `SERVER_SOCK_FD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// One half of a client's channel pair arrived; the orchestrator is
    /// still waiting for the other half. No readiness-set change.
    AwaitingPair,
    /// Both halves are in place; `session_id` is also the base of the
    /// client's 8-descriptor block.
    Connected { session_id: u32 },
    /// Fatal: abort the server loop.
    Fatal,
}

/// Outcome of tearing a session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Session torn down; `new_max_fd` is the orchestrator's updated high
    /// watermark for descriptor bookkeeping.
    Reassigned { new_max_fd: RawFd },
    /// Fatal: abort the server loop.
    Fatal,
}

/// Host callbacks the server loop drives. The orchestrator owns the actual
/// accept()/close() machinery; the loop only ever sees the outcome.
pub trait ServerUpcalls {
    fn on_connect(&mut self) -> ConnectOutcome;
    fn on_disconnect(&mut self, session_id: u32) -> DisconnectOutcome;
}

pub fn server_transmission_loop(mut upcalls: impl ServerUpcalls, tunables: Tunables) -> LoopOutcome {
    status::begin();
    signal::redirect_sigint();

    match run(&mut upcalls, &tunables) {
        Ok(()) => LoopOutcome::Abort,
        Err(err) => {
            warn!(error = %err, "server transmission loop exiting");
            err.outcome()
        }
    }
}

fn run(upcalls: &mut impl ServerUpcalls, tunables: &Tunables) -> Result<(), LoopError> {
    let mut poll = Poll::new().map_err(|e| LoopError::fatal("poll_new", e))?;
    let mut events = Events::with_capacity(tunables.packet_batch_size.max(8));

    poll.registry()
        .register(&mut SourceFd(&SERVER_SOCK_FD), Token(SERVER_SOCK_FD as usize), Interest::READABLE)
        .map_err(|e| LoopError::fatal("poll_register_server_sock", e))?;
    poll.registry()
        .register(&mut SourceFd(&L2TP_SOCK_FD), Token(L2TP_SOCK_FD as usize), Interest::READABLE)
        .map_err(|e| LoopError::fatal("poll_register_l2tp_sock", e))?;

    let mut sessions: IndexSet<u32> = IndexSet::new();
    let mut io = batch::IoBuffers::new(tunables);
    let mut lengths_buf = vec![0u8; tunables.lengths_staging_size()];
    let mut max_fd: RawFd = L2TP_SOCK_FD;

    loop {
        if !status::STATUS.is_running() {
            return Err(LoopError::fatal("signal", io::Error::new(io::ErrorKind::Interrupted, "SIGINT")));
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(LoopError::fatal("poll", e)),
        }

        // `current` is the snapshot this pass iterates; the disconnection
        // handler removes fds from it (as well as from the persistent
        // `sessions` set) so a client torn down mid-scan isn't revisited.
        let mut current: IndexSet<RawFd> = events.iter().map(|e| e.token().0 as RawFd).collect();
        let scan: Vec<RawFd> = current.iter().copied().collect();

        for fd in scan {
            if !current.contains(&fd) {
                continue;
            }
            if fd == SERVER_SOCK_FD {
                handle_accept(upcalls, &mut poll, &mut sessions, &mut max_fd)?;
            } else if fd == L2TP_SOCK_FD {
                handle_l2tp_batch(upcalls, &mut poll, &mut sessions, &mut current, &mut io, &mut max_fd)?;
            } else {
                let session_id = fd as u32;
                if session_stream_to_l2tp(session_id, &mut io, &mut lengths_buf, tunables).is_err() {
                    disconnect(upcalls, &mut poll, &mut sessions, &mut current, session_id, &mut max_fd)?;
                }
            }
        }
    }
}

fn handle_accept(
    upcalls: &mut impl ServerUpcalls,
    poll: &mut Poll,
    sessions: &mut IndexSet<u32>,
    max_fd: &mut RawFd,
) -> Result<(), LoopError> {
    match upcalls.on_connect() {
        ConnectOutcome::AwaitingPair => Ok(()),
        ConnectOutcome::Fatal => Err(LoopError::UpcallFailed),
        ConnectOutcome::Connected { session_id } => {
            let lengths_read = session_id as RawFd;
            poll.registry()
                .register(&mut SourceFd(&lengths_read), Token(lengths_read as usize), Interest::READABLE)
                .map_err(|e| LoopError::fatal("poll_register_session", e))?;
            sessions.insert(session_id);
            *max_fd = (*max_fd).max(lengths_read + 3);
            debug!(session_id, "client connected");
            Ok(())
        }
    }
}

fn disconnect(
    upcalls: &mut impl ServerUpcalls,
    poll: &mut Poll,
    sessions: &mut IndexSet<u32>,
    current: &mut IndexSet<RawFd>,
    session_id: u32,
    max_fd: &mut RawFd,
) -> Result<(), LoopError> {
    let lengths_read = session_id as RawFd;
    sessions.shift_remove(&session_id);
    current.shift_remove(&lengths_read);
    let _ = poll.registry().deregister(&mut SourceFd(&lengths_read));

    debug!(session_id, "client disconnected");
    match upcalls.on_disconnect(session_id) {
        DisconnectOutcome::Reassigned { new_max_fd } => {
            *max_fd = new_max_fd;
            Ok(())
        }
        DisconnectOutcome::Fatal => Err(LoopError::UpcallFailed),
    }
}

/// Drains `L2TP_SOCK_FD` in one batched receive, then dispatches the
/// datagrams grouped by **consecutive** runs of the same session id. A
/// session disconnected earlier in this same scan is skipped (its absence
/// from `sessions` is the check); non-consecutive datagrams for one id
/// become separate sub-batches, which preserves per-id order at the cost of
/// not fully coalescing an interleaved stream.
fn handle_l2tp_batch(
    upcalls: &mut impl ServerUpcalls,
    poll: &mut Poll,
    sessions: &mut IndexSet<u32>,
    current: &mut IndexSet<RawFd>,
    io: &mut batch::IoBuffers,
    max_fd: &mut RawFd,
) -> Result<(), LoopError> {
    let received = batch::recv_batch(L2TP_SOCK_FD, io).map_err(|e| LoopError::fatal_batch("l2tp_sock", e))?;
    if received == 0 {
        return Ok(());
    }

    let mut i = 0;
    while i < received {
        let session_id = match framing::session_id(io.payload(i)) {
            Some(id) => id,
            None => {
                i += 1;
                continue;
            }
        };
        let mut j = i + 1;
        while j < received && framing::session_id(io.payload(j)) == Some(session_id) {
            j += 1;
        }

        if sessions.contains(&session_id) && write_subbatch_to_session(session_id, io, i, j).is_err() {
            disconnect(upcalls, poll, sessions, current, session_id, max_fd)?;
        }
        i = j;
    }
    Ok(())
}

fn write_subbatch_to_session(session_id: u32, io: &mut batch::IoBuffers, start: usize, end: usize) -> Result<(), LoopError> {
    let lengths_write = session_id as RawFd + 1;
    let packets_write = session_id as RawFd + 4;
    let count = end - start;

    let mut lengths_out = vec![0u8; count * 2];
    let mut total = 0usize;
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(count);
    for (k, i) in (start..end).enumerate() {
        let len = io.len(i);
        lengths_out[k * 2..k * 2 + 2].copy_from_slice(&framing::encode_len(len));
        total += len;
        iovecs.push(libc::iovec {
            iov_base: io.payload_mut(i).as_mut_ptr() as *mut _,
            iov_len: len,
        });
    }

    full_write(lengths_write, &lengths_out).map_err(|e| LoopError::transient("lengths_write", e.into_io()))?;
    full_writev(packets_write, &mut iovecs, total).map_err(|e| LoopError::transient("packets_write", e.into_io()))?;
    Ok(())
}

/// The server-side mirror of the client loop's streams->sock path: pulls a
/// batch of frames off one session's streams and sends them as L2TP
/// datagrams on the shared socket.
fn session_stream_to_l2tp(
    session_id: u32,
    io: &mut batch::IoBuffers,
    lengths_buf: &mut [u8],
    tunables: &Tunables,
) -> Result<(), LoopError> {
    let lengths_read = session_id as RawFd;
    let packets_read = session_id as RawFd + 3;

    let n = read_lengths_batch(lengths_read, lengths_buf)?;
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

    full_readv(packets_read, &mut iovecs, total).map_err(|e| LoopError::transient("packets_read", e.into_io()))?;
    batch::send_batch(L2TP_SOCK_FD, io, frame_count).map_err(|e| LoopError::fatal_batch("l2tp_sock", e))?;
    Ok(())
}

fn read_lengths_batch(fd: RawFd, buf: &mut [u8]) -> Result<usize, LoopError> {
    let mut total = 0usize;
    loop {
        let n = unsafe { libc::read(fd, buf[total..].as_mut_ptr() as *mut _, buf.len() - total) };
        if n < 0 {
            return Err(LoopError::transient(
                "session_lengths_read",
                io::Error::last_os_error(),
            ));
        }
        if n == 0 {
            return Err(LoopError::transient(
                "session_lengths_read",
                io::Error::new(io::ErrorKind::UnexpectedEof, "session lengths stream closed"),
            ));
        }
        total += n as usize;
        if total % 2 == 0 {
            return Ok(total);
        }
        warn!(total, "odd byte count on session lengths stream, continuing read");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use serial_test::serial;

    struct FakeUpcalls {
        connect_outcomes: Vec<ConnectOutcome>,
        disconnects: Vec<u32>,
    }

    impl ServerUpcalls for FakeUpcalls {
        fn on_connect(&mut self) -> ConnectOutcome {
            self.connect_outcomes.remove(0)
        }
        fn on_disconnect(&mut self, session_id: u32) -> DisconnectOutcome {
            self.disconnects.push(session_id);
            DisconnectOutcome::Reassigned { new_max_fd: session_id as RawFd }
        }
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn dup2_onto(src: RawFd, target: RawFd) {
        let rc = unsafe { libc::dup2(src, target) };
        assert!(rc >= 0, "dup2 failed: {}", io::Error::last_os_error());
    }

    #[test]
    fn handle_accept_registers_session_and_bumps_max_fd() {
        let (lengths_read, _lengths_write) = make_pipe();
        let mut poll = Poll::new().unwrap();
        let mut sessions = IndexSet::new();
        let mut max_fd = 4;
        let mut upcalls = FakeUpcalls {
            connect_outcomes: vec![ConnectOutcome::Connected { session_id: lengths_read as u32 }],
            disconnects: vec![],
        };

        handle_accept(&mut upcalls, &mut poll, &mut sessions, &mut max_fd).unwrap();

        assert!(sessions.contains(&(lengths_read as u32)));
        assert_eq!(max_fd, lengths_read + 3);

        unsafe { libc::close(_lengths_write) };
    }

    #[test]
    fn handle_accept_awaiting_pair_is_a_no_op() {
        let mut poll = Poll::new().unwrap();
        let mut sessions = IndexSet::new();
        let mut max_fd = 4;
        let mut upcalls = FakeUpcalls { connect_outcomes: vec![ConnectOutcome::AwaitingPair], disconnects: vec![] };

        handle_accept(&mut upcalls, &mut poll, &mut sessions, &mut max_fd).unwrap();
        assert!(sessions.is_empty());
        assert_eq!(max_fd, 4);
    }

    #[test]
    fn handle_accept_fatal_upcall_aborts() {
        let mut poll = Poll::new().unwrap();
        let mut sessions = IndexSet::new();
        let mut max_fd = 4;
        let mut upcalls = FakeUpcalls { connect_outcomes: vec![ConnectOutcome::Fatal], disconnects: vec![] };

        let err = handle_accept(&mut upcalls, &mut poll, &mut sessions, &mut max_fd).unwrap_err();
        assert!(matches!(err, LoopError::UpcallFailed));
    }

    #[test]
    fn disconnect_removes_session_and_calls_upcall() {
        let (lengths_read, write_end) = make_pipe();
        let session_id = lengths_read as u32;
        let mut poll = Poll::new().unwrap();
        let mut sessions: IndexSet<u32> = [session_id].into_iter().collect();
        let mut current: IndexSet<RawFd> = [lengths_read].into_iter().collect();
        let mut max_fd = lengths_read + 3;
        let mut upcalls = FakeUpcalls { connect_outcomes: vec![], disconnects: vec![] };

        disconnect(&mut upcalls, &mut poll, &mut sessions, &mut current, session_id, &mut max_fd).unwrap();

        assert!(!sessions.contains(&session_id));
        assert!(!current.contains(&lengths_read));
        assert_eq!(upcalls.disconnects, vec![session_id]);

        unsafe { libc::close(write_end) };
    }

    #[test]
    #[serial]
    fn write_subbatch_to_session_writes_lengths_and_payloads() {
        let session_id: RawFd = 700;
        let (lengths_read, lengths_write_src) = make_pipe();
        dup2_onto(lengths_write_src, session_id + 1);
        unsafe { libc::close(lengths_write_src) };

        let (packets_read, packets_write_src) = make_pipe();
        dup2_onto(packets_write_src, session_id + 4);
        unsafe { libc::close(packets_write_src) };

        let tunables = Tunables::default();
        let mut io = batch::IoBuffers::new(&tunables);
        io.payload_mut(0)[..3].copy_from_slice(b"abc");
        io.set_len(0, 3);
        io.payload_mut(1)[..2].copy_from_slice(b"de");
        io.set_len(1, 2);

        write_subbatch_to_session(session_id as u32, &mut io, 0, 2).unwrap();

        let mut lengths_out = [0u8; 4];
        assert_eq!(unsafe { libc::read(lengths_read, lengths_out.as_mut_ptr() as *mut _, 4) }, 4);
        assert_eq!(framing::decode_len([lengths_out[0], lengths_out[1]], 4096).unwrap(), 3);
        assert_eq!(framing::decode_len([lengths_out[2], lengths_out[3]], 4096).unwrap(), 2);

        let mut payload_out = [0u8; 5];
        assert_eq!(unsafe { libc::read(packets_read, payload_out.as_mut_ptr() as *mut _, 5) }, 5);
        assert_eq!(&payload_out, b"abcde");

        unsafe {
            libc::close(lengths_read);
            libc::close(packets_read);
            libc::close(session_id + 1);
            libc::close(session_id + 4);
        }
    }

    #[test]
    #[serial]
    fn session_stream_to_l2tp_sends_staged_batch() {
        let session_id: RawFd = 800;
        let (lengths_read_src, lengths_write) = make_pipe();
        dup2_onto(lengths_read_src, session_id);
        unsafe { libc::close(lengths_read_src) };

        let (packets_read_src, packets_write) = make_pipe();
        dup2_onto(packets_read_src, session_id + 3);
        unsafe { libc::close(packets_read_src) };

        let l2tp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        l2tp_sock.connect(peer.local_addr().unwrap()).unwrap();
        peer.connect(l2tp_sock.local_addr().unwrap()).unwrap();
        dup2_onto(l2tp_sock.as_raw_fd(), L2TP_SOCK_FD);

        let payload = b"hello-session";
        let len_prefix = framing::encode_len(payload.len());
        unsafe {
            libc::write(lengths_write, len_prefix.as_ptr() as *const _, 2);
            libc::write(packets_write, payload.as_ptr() as *const _, payload.len());
        }

        let tunables = Tunables::default();
        let mut io = batch::IoBuffers::new(&tunables);
        let mut lengths_buf = vec![0u8; tunables.lengths_staging_size()];

        session_stream_to_l2tp(session_id as u32, &mut io, &mut lengths_buf, &tunables).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.set_nonblocking(true).unwrap();
        let mut out = [0u8; 32];
        let n = peer.recv(&mut out).unwrap();
        assert_eq!(&out[..n], payload);

        unsafe {
            libc::close(session_id);
            libc::close(lengths_write);
            libc::close(session_id + 3);
            libc::close(packets_write);
            libc::close(L2TP_SOCK_FD);
        }
    }

    #[test]
    #[serial]
    fn handle_l2tp_batch_coalesces_consecutive_session_ids_and_skips_unknown() {
        let l2tp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        l2tp_sock.connect(sender.local_addr().unwrap()).unwrap();
        sender.connect(l2tp_sock.local_addr().unwrap()).unwrap();
        dup2_onto(l2tp_sock.as_raw_fd(), L2TP_SOCK_FD);

        let session_a: RawFd = 900;
        let session_b: RawFd = 920;

        let (lengths_read_a, lengths_write_src) = make_pipe();
        dup2_onto(lengths_write_src, session_a + 1);
        unsafe { libc::close(lengths_write_src) };
        let (packets_read_a, packets_write_src) = make_pipe();
        dup2_onto(packets_write_src, session_a + 4);
        unsafe { libc::close(packets_write_src) };

        let frame_with_session = |sid: u32| {
            let mut f = vec![0u8; 16];
            f[4..8].copy_from_slice(&sid.to_be_bytes());
            f
        };
        let a_frame = frame_with_session(session_a as u32);
        let b_frame = frame_with_session(session_b as u32);

        sender.send(&a_frame).unwrap();
        sender.send(&a_frame).unwrap();
        sender.send(&b_frame).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let tunables = Tunables::default();
        let mut io = batch::IoBuffers::new(&tunables);
        let mut poll = Poll::new().unwrap();
        let mut sessions: IndexSet<u32> = [session_a as u32].into_iter().collect();
        let mut current: IndexSet<RawFd> = IndexSet::new();
        let mut max_fd = session_a + 7;
        let mut upcalls = FakeUpcalls { connect_outcomes: vec![], disconnects: vec![] };

        handle_l2tp_batch(&mut upcalls, &mut poll, &mut sessions, &mut current, &mut io, &mut max_fd).unwrap();

        // The two session_a frames arrive back to back and coalesce into one
        // sub-batch: one writev of both payloads, one write of both length
        // prefixes.
        let mut lengths_out = [0u8; 4];
        assert_eq!(unsafe { libc::read(lengths_read_a, lengths_out.as_mut_ptr() as *mut _, 4) }, 4);
        assert_eq!(framing::decode_len([lengths_out[0], lengths_out[1]], 4096).unwrap(), 16);
        assert_eq!(framing::decode_len([lengths_out[2], lengths_out[3]], 4096).unwrap(), 16);

        let mut payload_out = [0u8; 32];
        assert_eq!(unsafe { libc::read(packets_read_a, payload_out.as_mut_ptr() as *mut _, 32) }, 32);
        assert_eq!(&payload_out[..16], &a_frame[..]);
        assert_eq!(&payload_out[16..], &a_frame[..]);

        // session_b was never registered, so it's silently skipped; no
        // disconnect fires for an id that was never connected.
        assert!(upcalls.disconnects.is_empty());

        unsafe {
            libc::close(lengths_read_a);
            libc::close(packets_read_a);
            libc::close(session_a + 1);
            libc::close(session_a + 4);
            libc::close(L2TP_SOCK_FD);
        }
    }
}
