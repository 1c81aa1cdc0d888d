//! In-process tuning knobs.
//!
//! The core has no file or CLI configuration of its own -- everything that
//! describes *how* to reach a peer (SSH target, TAP name, credentials) is the
//! orchestrator's concern. The only "configuration surface" the core accepts
//! is this small `Copy` struct of sizes, which earlier revisions of the
//! engine hard-coded as preprocessor constants.

/// Ethernet (or L2TP-encapsulated Ethernet) payload ceiling. Chosen to be the
/// larger of the two sizes seen across revisions of the engine (1514 raw
/// Ethernet vs. 4096 L2TP-encapsulated), since the server side has to
/// accommodate both a TAP-origin and a UDP-origin frame through the same
/// buffers.
pub const MAX_PAYLOAD: usize = 4096;

/// Size of the big-endian length prefix that turns a byte stream into a
/// sequence of frames.
pub const LENGTH_SIZE: usize = 2;

/// Number of datagrams handled by one `recvmmsg`/`sendmmsg` call.
pub const PACKET_BATCH_SIZE: usize = 32;

/// Default ring buffer capacity for the single-stream, ring-based discipline
/// used by the endpoint loop and by [`crate::client::RingClientLoop`].
pub const DEFAULT_RING_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub max_payload: usize,
    pub packet_batch_size: usize,
    pub ring_capacity: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            max_payload: MAX_PAYLOAD,
            packet_batch_size: PACKET_BATCH_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl Tunables {
    /// Bytes needed to stage the length prefixes for one full batch.
    #[inline]
    pub fn lengths_staging_size(&self) -> usize {
        LENGTH_SIZE * self.packet_batch_size
    }
}
