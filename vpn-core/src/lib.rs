//! Shared building blocks for the VPN transmission loops: framing, the
//! circular buffer, partial-I/O helpers, batched UDP I/O and SIGINT
//! handling. The loops themselves -- client, endpoint and server -- live in
//! `vpn-client` and `vpn-server`, which depend on this crate rather than on
//! each other.

pub mod batch;
pub mod error;
pub mod framing;
pub mod iovec;
pub mod ring;
pub mod signal;
pub mod status;
pub mod tunables;

pub use error::{BatchError, FramingError, IoVecError, LoopError, LoopOutcome, RingError};
pub use tunables::Tunables;
