use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Default cap on a single boundary message. Stands in for the sandbox
/// memory bound of an out-of-process guest.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("frame truncated: expected {expected} bytes, have {have}")]
    Truncated { expected: usize, have: usize },

    #[error("malformed frame payload: {0}")]
    Malformed(String),
}

/// Encode one boundary message as a length-prefixed byte buffer
/// (u32 little-endian length, then the serialized payload).
pub fn encode_frame<T: Serialize>(value: &T, max_len: usize) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(value).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if payload.len() > max_len {
        return Err(CodecError::TooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the front of `bytes`; returns the message and the
/// number of bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_len: usize,
) -> Result<(T, usize), CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Truncated {
            expected: 4,
            have: bytes.len(),
        });
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_len {
        return Err(CodecError::TooLarge { len, max: max_len });
    }
    let end = 4 + len;
    if bytes.len() < end {
        return Err(CodecError::Truncated {
            expected: end,
            have: bytes.len(),
        });
    }
    let value = serde_json::from_slice(&bytes[4..end])
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok((value, end))
}
