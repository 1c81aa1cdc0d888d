//! Length-prefixed framing and L2TP session-id extraction.
//!
//! A frame on the wire is a 2-byte big-endian length prefix followed by that
//! many bytes of Ethernet payload. The session id used for server-side
//! dispatch is not part of the framing layer itself -- it's read out of the
//! payload once a full frame has been assembled.

use crate::error::FramingError;

/// Offset of the 32-bit big-endian L2TP session id within a frame's payload.
pub const SESSION_ID_OFFSET: usize = 4;

#[inline]
pub fn encode_len(len: usize) -> [u8; 2] {
    debug_assert!(len <= u16::MAX as usize);
    (len as u16).to_be_bytes()
}

#[inline]
pub fn decode_len(bytes: [u8; 2], max_payload: usize) -> Result<usize, FramingError> {
    let len = u16::from_be_bytes(bytes) as usize;
    if len > max_payload {
        return Err(FramingError::PayloadTooLarge(len, max_payload));
    }
    Ok(len)
}

/// Reads the big-endian L2TP session id at [`SESSION_ID_OFFSET`], or `None`
/// if `frame` is too short to carry one.
#[inline]
pub fn session_id(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = frame
        .get(SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4)?
        .try_into()
        .ok()?;
    Some(u32::from_be_bytes(bytes))
}
