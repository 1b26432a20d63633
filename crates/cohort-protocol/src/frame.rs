//! Length-prefixed wire framing.
//!
//! Every message on a TCP connection is wrapped in a frame:
//!
//! ```text
//! +----------+----------+------------------+
//! | Magic(4) | Len(4)   | Payload(Len)     |
//! +----------+----------+------------------+
//! ```
//!
//! The payload is the bincode encoding of the message. Frames are capped
//! to keep a misbehaving peer from forcing unbounded allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Frame magic number ("CHRT").
pub const FRAME_MAGIC: u32 = 0x43485254;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors from frame encoding and decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame header had an unexpected magic number.
    #[error("invalid frame magic: {0:08x}")]
    InvalidMagic(u32),

    /// The frame payload exceeded [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// The payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Encodes a message into a framed byte buffer.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, FrameError> {
    let payload = bincode::serialize(message).map_err(|e| FrameError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// consumed bytes are removed from `buf` only when a full frame is read.
pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, FrameError> {
    if buf.len() < 8 {
        return Ok(None);
    }

    let mut header = &buf[..8];
    let magic = header.get_u32();
    if magic != FRAME_MAGIC {
        return Err(FrameError::InvalidMagic(magic));
    }

    let len = header.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    if buf.len() < 8 + len {
        return Ok(None);
    }

    buf.advance(8);
    let payload = buf.split_to(len);
    let message =
        bincode::deserialize(&payload).map_err(|e| FrameError::Codec(e.to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{PollRequest, RaftMessage};

    #[test]
    fn test_encode_decode_round_trip() {
        let message = RaftMessage::Poll(PollRequest {
            term: 4,
            candidate: 2,
            log_index: 10,
            log_term: 3,
        });

        let framed = encode(&message).unwrap();
        let mut buf = BytesMut::from(&framed[..]);
        let decoded: RaftMessage = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let message = RaftMessage::Poll(PollRequest {
            term: 1,
            candidate: 1,
            log_index: 0,
            log_term: 0,
        });
        let framed = encode(&message).unwrap();

        let mut buf = BytesMut::from(&framed[..framed.len() - 1]);
        let result: Option<RaftMessage> = decode(&mut buf).unwrap();
        assert!(result.is_none());

        // Completing the frame makes it decodable.
        buf.extend_from_slice(&framed[framed.len() - 1..]);
        let decoded: RaftMessage = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xdeadbeef);
        buf.put_u32(0);
        let result: Result<Option<RaftMessage>, _> = decode(&mut buf);
        assert!(matches!(result, Err(FrameError::InvalidMagic(_))));
    }

    #[test]
    fn test_decode_two_frames() {
        let a = RaftMessage::Poll(PollRequest {
            term: 1,
            candidate: 1,
            log_index: 0,
            log_term: 0,
        });
        let b = RaftMessage::Poll(PollRequest {
            term: 2,
            candidate: 2,
            log_index: 5,
            log_term: 1,
        });

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&a).unwrap());
        buf.extend_from_slice(&encode(&b).unwrap());

        let first: RaftMessage = decode(&mut buf).unwrap().unwrap();
        let second: RaftMessage = decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert!(buf.is_empty());
    }
}
