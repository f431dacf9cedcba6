//! Binary stream frame encoding/decoding
//!
//! A stream frame is sent as a single binary websocket message on the relay
//! path. On the peer path it is cut into [`crate::chunk`] pieces first.
//!
//! Layout:
//! - version: 1 byte
//! - agent_id_len: 1 byte
//! - sequence: 8 bytes (u64, big-endian)
//! - captured_at: 8 bytes (u64, big-endian, ms since the Unix epoch)
//! - agent_id: `agent_id_len` bytes of UTF-8
//! - payload: the rest (encoded image)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::ids::AgentId;

/// Current frame format version
pub const FRAME_VERSION: u8 = 1;

/// Size of the fixed part of the header in bytes
pub const HEADER_SIZE: usize = 18;

/// Maximum payload size (16MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// One encoded capture of an agent's display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Agent that captured the frame
    pub agent_id: AgentId,
    /// Monotonic per live session, starting at 1
    pub sequence: u64,
    /// Capture time in ms since the Unix epoch
    pub captured_at: u64,
    /// Encoded image bytes
    pub payload: Bytes,
}

impl StreamFrame {
    /// Create a new frame
    pub fn new(agent_id: AgentId, sequence: u64, captured_at: u64, payload: Bytes) -> Self {
        Self {
            agent_id,
            sequence,
            captured_at,
            payload,
        }
    }

    /// Encoded length of this frame
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.agent_id.as_str().len() + self.payload.len()
    }

    /// Encode the frame into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let id = self.agent_id.as_str().as_bytes();
        if id.len() > u8::MAX as usize {
            return Err(ProtocolError::AgentIdTooLong(id.len()));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(id.len() as u8);
        dst.put_u64(self.sequence);
        dst.put_u64(self.captured_at);
        dst.put_slice(id);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode the frame into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete frame.
    ///
    /// The payload shares the input buffer, no copy is made.
    pub fn decode(mut src: Bytes) -> Result<Self, ProtocolError> {
        let id_len = check_header(&src)?;

        src.advance(2);
        let sequence = src.get_u64();
        let captured_at = src.get_u64();
        let id = src.split_to(id_len);
        let agent_id = std::str::from_utf8(&id).map_err(|_| ProtocolError::InvalidAgentId)?;

        if src.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: src.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            agent_id: AgentId::new(agent_id),
            sequence,
            captured_at,
            payload: src,
        })
    }
}

/// Read the agent id from an encoded frame without decoding the rest.
///
/// The hub uses this to check the sender of a relayed frame before
/// forwarding the original bytes.
pub fn peek_agent_id(src: &[u8]) -> Result<&str, ProtocolError> {
    let id_len = check_header(src)?;
    std::str::from_utf8(&src[HEADER_SIZE..HEADER_SIZE + id_len])
        .map_err(|_| ProtocolError::InvalidAgentId)
}

/// Read the sequence number from an encoded frame
pub fn peek_sequence(src: &[u8]) -> Result<u64, ProtocolError> {
    check_header(src)?;
    let mut seq = &src[2..10];
    Ok(seq.get_u64())
}

/// Validate version and length, returning the agent id length
fn check_header(src: &[u8]) -> Result<usize, ProtocolError> {
    if src.len() < HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE,
            actual: src.len(),
        });
    }
    if src[0] != FRAME_VERSION {
        return Err(ProtocolError::UnsupportedVersion(src[0]));
    }

    let id_len = src[1] as usize;
    if id_len == 0 {
        return Err(ProtocolError::InvalidHeader);
    }
    if src.len() < HEADER_SIZE + id_len {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE + id_len,
            actual: src.len(),
        });
    }
    Ok(id_len)
}
