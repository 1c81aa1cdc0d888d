//! The endpoint transmission loop: the simplest of the three, a symmetric
//! byte pump with no framing of its own. It runs inside the shell process
//! the client ssh's into, shuttling opaque bytes between that process's
//! stdin/stdout and a local socket or TAP device that the client end has
//! already framed.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::warn;

use vpn_core::ring::Ring;
use vpn_core::status;
use vpn_core::{signal, LoopError, LoopOutcome, Tunables};

const SOCK_TOKEN: Token = Token(0);
const STDIN_TOKEN: Token = Token(1);
const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Runs the endpoint loop until SIGINT or an I/O error, both of which are
/// fatal here -- there is no reinit concept for a loop with no subprocess of
/// its own to rebuild.
pub fn endpoint_transmission_loop(sock_fd: RawFd, tunables: Tunables) -> LoopOutcome {
    status::begin();
    signal::redirect_sigint();

    match run(sock_fd, &tunables) {
        Ok(()) => LoopOutcome::Abort,
        Err(err) => {
            warn!(error = %err, "endpoint transmission loop exiting");
            err.outcome()
        }
    }
}

fn run(sock_fd: RawFd, tunables: &Tunables) -> Result<(), LoopError> {
    let mut poll = Poll::new().map_err(|e| LoopError::fatal("poll_new", e))?;
    let mut events = Events::with_capacity(2);
    poll.registry()
        .register(&mut SourceFd(&sock_fd), SOCK_TOKEN, Interest::READABLE)
        .map_err(|e| LoopError::fatal("poll_register_sock", e))?;
    poll.registry()
        .register(&mut SourceFd(&STDIN_FD), STDIN_TOKEN, Interest::READABLE)
        .map_err(|e| LoopError::fatal("poll_register_stdin", e))?;

    let mut sock_to_stdout = Ring::new(tunables.ring_capacity);
    let mut stdin_to_sock = Ring::new(tunables.ring_capacity);

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
                SOCK_TOKEN => {
                    sock_to_stdout.fill(sock_fd).map_err(|e| LoopError::fatal("sock_fd", e.into_io()))?;
                    sock_to_stdout
                        .flush(sock_to_stdout.level(), STDOUT_FD)
                        .map_err(|e| LoopError::fatal("stdout", e.into_io()))?;
                }
                STDIN_TOKEN => {
                    stdin_to_sock.fill(STDIN_FD).map_err(|e| LoopError::fatal("stdin", e.into_io()))?;
                    stdin_to_sock
                        .flush(stdin_to_sock.level(), sock_fd)
                        .map_err(|e| LoopError::fatal("sock_fd", e.into_io()))?;
                }
                _ => unreachable!("unregistered token"),
            }
        }
    }
}
