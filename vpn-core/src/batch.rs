//! Batched UDP I/O and the shared payload pool the client and server loops
//! stage datagrams through.
//!
//! `recvmmsg`/`sendmmsg` amortize the per-syscall overhead of moving many
//! small datagrams across one socket, which is the dominant cost once a
//! tunnel is carrying more than a handful of flows. Both calls operate over
//! a fixed pool of payload buffers sized to one batch so that no allocation
//! happens on the per-packet path.

use crate::error::BatchError;
use crate::tunables::Tunables;
use libc::{c_uint, iovec, mmsghdr, msghdr};
use std::os::fd::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Receiving,
    Sending,
}

/// A fixed pool of `packet_batch_size` payload buffers shared between the
/// receive and send paths of one loop iteration. The single-threaded loop
/// never interleaves a receive and a send into the same slot; in debug
/// builds each slot's tag is checked so a violation panics instead of
/// silently aliasing two in-flight buffers.
pub struct IoBuffers {
    payloads: Vec<Box<[u8]>>,
    lengths: Vec<usize>,
    states: Vec<SlotState>,
    max_payload: usize,
}

impl IoBuffers {
    pub fn new(tunables: &Tunables) -> Self {
        let n = tunables.packet_batch_size;
        IoBuffers {
            payloads: (0..n).map(|_| vec![0u8; tunables.max_payload].into_boxed_slice()).collect(),
            lengths: vec![0; n],
            states: vec![SlotState::Idle; n],
            max_payload: tunables.max_payload,
        }
    }

    pub fn capacity(&self) -> usize {
        self.payloads.len()
    }

    pub fn payload(&self, slot: usize) -> &[u8] {
        &self.payloads[slot][..self.lengths[slot]]
    }

    pub fn payload_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.payloads[slot]
    }

    pub fn len(&self, slot: usize) -> usize {
        self.lengths[slot]
    }

    pub fn set_len(&mut self, slot: usize, len: usize) {
        self.lengths[slot] = len;
    }

    #[inline]
    fn begin_receive(&mut self, slot: usize) {
        debug_assert_eq!(self.states[slot], SlotState::Idle, "slot {slot} reused while in flight");
        self.states[slot] = SlotState::Receiving;
    }

    #[inline]
    fn begin_send(&mut self, slot: usize) {
        debug_assert_ne!(
            self.states[slot],
            SlotState::Receiving,
            "slot {slot} queued for send while still being received into"
        );
        self.states[slot] = SlotState::Sending;
    }

    #[inline]
    fn end(&mut self, slot: usize) {
        self.states[slot] = SlotState::Idle;
    }
}

fn empty_msghdr(iov: *mut iovec) -> msghdr {
    msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: iov,
        msg_iovlen: 1,
        msg_control: std::ptr::null_mut(),
        msg_controllen: 0,
        msg_flags: 0,
    }
}

/// Receives up to `io.capacity()` datagrams from `fd` in one `recvmmsg`
/// call. Returns the number of datagrams received; `Ok(0)` covers both
/// "nothing pending" (EWOULDBLOCK/EAGAIN) and an empty ready batch.
pub fn recv_batch(fd: RawFd, io: &mut IoBuffers) -> Result<usize, BatchError> {
    let batch = io.capacity();
    let mut iovecs: Vec<iovec> = (0..batch)
        .map(|i| iovec {
            iov_base: io.payloads[i].as_mut_ptr() as *mut _,
            iov_len: io.max_payload,
        })
        .collect();
    let mut msgs: Vec<mmsghdr> = iovecs
        .iter_mut()
        .map(|iov| mmsghdr {
            msg_hdr: empty_msghdr(iov as *mut iovec),
            msg_len: 0,
        })
        .collect();

    for i in 0..batch {
        io.begin_receive(i);
    }

    let received = unsafe {
        libc::recvmmsg(
            fd,
            msgs.as_mut_ptr(),
            batch as c_uint,
            libc::MSG_DONTWAIT,
            std::ptr::null_mut(),
        )
    };

    if received < 0 {
        let err = std::io::Error::last_os_error();
        for i in 0..batch {
            io.end(i);
        }
        return match err.kind() {
            std::io::ErrorKind::WouldBlock => Ok(0),
            _ => Err(BatchError::Io(err)),
        };
    }

    let received = received as usize;
    for (i, msg) in msgs.iter().enumerate().take(received) {
        io.set_len(i, msg.msg_len as usize);
    }
    for i in 0..batch {
        io.end(i);
    }

    Ok(received)
}

/// Sends the first `count` staged slots of `io` in one `sendmmsg` call.
/// Anything short of `count` messages sent is reported as
/// [`BatchError::Short`] -- a connected UDP socket either accepts a whole
/// datagram or rejects it, so a partial batch means something is wrong with
/// the socket, not a transient backlog.
pub fn send_batch(fd: RawFd, io: &mut IoBuffers, count: usize) -> Result<usize, BatchError> {
    if count == 0 {
        return Ok(0);
    }
    let mut iovecs: Vec<iovec> = (0..count)
        .map(|i| iovec {
            iov_base: io.payloads[i].as_mut_ptr() as *mut _,
            iov_len: io.lengths[i],
        })
        .collect();
    let mut msgs: Vec<mmsghdr> = iovecs
        .iter_mut()
        .map(|iov| mmsghdr {
            msg_hdr: empty_msghdr(iov as *mut iovec),
            msg_len: 0,
        })
        .collect();

    for i in 0..count {
        io.begin_send(i);
    }

    let sent = unsafe { libc::sendmmsg(fd, msgs.as_mut_ptr(), count as c_uint, 0) };

    for i in 0..count {
        io.end(i);
    }

    if sent < 0 {
        return Err(BatchError::Io(std::io::Error::last_os_error()));
    }
    let sent = sent as usize;
    if sent != count {
        return Err(BatchError::Short { sent, requested: count });
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    fn connected_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn send_then_recv_batch_round_trips() {
        let tunables = Tunables::default();
        let (sender, receiver) = connected_pair();

        let mut send_io = IoBuffers::new(&tunables);
        for i in 0..3 {
            let payload = vec![i as u8; 10 + i];
            send_io.payload_mut(i)[..payload.len()].copy_from_slice(&payload);
            send_io.set_len(i, payload.len());
        }
        let sent = send_batch(sender.as_raw_fd(), &mut send_io, 3).unwrap();
        assert_eq!(sent, 3);

        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut recv_io = IoBuffers::new(&tunables);
        let received = recv_batch(receiver.as_raw_fd(), &mut recv_io).unwrap();
        assert_eq!(received, 3);
        for i in 0..3 {
            assert_eq!(recv_io.len(i), 10 + i);
            assert!(recv_io.payload(i).iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn recv_batch_on_empty_socket_returns_zero() {
        let tunables = Tunables::default();
        let (_sender, receiver) = connected_pair();
        let mut io = IoBuffers::new(&tunables);
        assert_eq!(recv_batch(receiver.as_raw_fd(), &mut io).unwrap(), 0);
    }
}
