use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame payload length {0} exceeds max_payload {1}")]
    PayloadTooLarge(usize, usize),
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring buffer has no room for {requested} bytes ({available} available)")]
    NoRoom { requested: usize, available: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RingError {
    /// Collapses the variant into a plain `io::Error`, for callers that pick
    /// their own `LoopError` severity (ring failures mean different things
    /// to the ring-based client loop, the endpoint pump and tests).
    pub fn into_io(self) -> io::Error {
        match self {
            RingError::Io(e) => e,
            RingError::NoRoom { requested, available } => io::Error::new(
                io::ErrorKind::Other,
                format!("ring has no room for {requested} bytes ({available} available)"),
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum IoVecError {
    #[error("transfer stalled: expected {expected} bytes total, {handled} handled before a zero-length transfer")]
    NoProgress { expected: usize, handled: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IoVecError {
    pub fn into_io(self) -> io::Error {
        match self {
            IoVecError::Io(e) => e,
            IoVecError::NoProgress { expected, handled } => {
                io::Error::new(io::ErrorKind::WriteZero, format!("stalled after {handled} of {expected} bytes"))
            }
        }
    }
}

/// Error from one `recvmmsg`/`sendmmsg` batch call.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("short batched send: sent {sent} of {requested} messages")]
    Short { sent: usize, requested: usize },
}

impl BatchError {
    pub fn into_io(self) -> io::Error {
        match self {
            BatchError::Io(e) => e,
            BatchError::Short { sent, requested } => {
                io::Error::new(io::ErrorKind::Other, format!("sent {sent} of {requested} messages"))
            }
        }
    }
}

/// What a caller should do once a transmission loop has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Transient stream failure: tear this loop down and build a fresh one
    /// over a new connection.
    Reinit,
    /// Fatal error or user interrupt: do not retry.
    Abort,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("transient stream failure on {label}")]
    Transient {
        label: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("fatal error on {label}")]
    Fatal {
        label: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("short batched send: sent {sent} of {requested} messages")]
    ShortBatchSend { sent: usize, requested: usize },
    #[error("upcall rejected the event")]
    UpcallFailed,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

impl LoopError {
    pub fn transient(label: &'static str, source: io::Error) -> Self {
        LoopError::Transient { label, source }
    }

    pub fn fatal(label: &'static str, source: io::Error) -> Self {
        LoopError::Fatal { label, source }
    }

    /// Converts a batch I/O failure into a fatal loop error, preserving the
    /// sent/requested counts on a short send rather than collapsing it to a
    /// generic `io::Error`.
    pub fn fatal_batch(label: &'static str, err: BatchError) -> Self {
        match err {
            BatchError::Io(source) => LoopError::Fatal { label, source },
            BatchError::Short { sent, requested } => LoopError::ShortBatchSend { sent, requested },
        }
    }

    /// Maps an error to the outcome a loop caller should act on.
    pub fn outcome(&self) -> LoopOutcome {
        match self {
            LoopError::Transient { .. } => LoopOutcome::Reinit,
            LoopError::Fatal { .. }
            | LoopError::ShortBatchSend { .. }
            | LoopError::UpcallFailed
            | LoopError::Framing(_) => LoopOutcome::Abort,
        }
    }
}
