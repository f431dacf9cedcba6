//! Frame pieces for the peer data channel
//!
//! A data channel message is capped well below a typical encoded frame, so
//! the agent cuts each encoded [`StreamFrame`](crate::StreamFrame) into
//! pieces. Every piece is one binary message:
//! - version: 1 byte
//! - frame_id: 8 bytes (u64, big-endian)
//! - index: 2 bytes (u16, big-endian)
//! - count: 2 bytes (u16, big-endian)
//! - data: the rest
//!
//! The channel is unordered and lossy. [`ChunkAssembler`] accepts pieces in
//! any order, only ever builds the newest frame, and silently drops a frame
//! that is still incomplete when a newer one starts.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Current piece format version
pub const CHUNK_VERSION: u8 = 1;

/// Size of the piece header in bytes
pub const CHUNK_HEADER_SIZE: usize = 13;

/// One piece of an encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChunk {
    /// Increases with every frame sent on a link
    pub frame_id: u64,
    /// Position of this piece, starting at 0
    pub index: u16,
    /// Number of pieces in the frame
    pub count: u16,
    pub data: Bytes,
}

impl FrameChunk {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.data.len());
        buf.put_u8(CHUNK_VERSION);
        buf.put_u64(self.frame_id);
        buf.put_u16(self.index);
        buf.put_u16(self.count);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, ProtocolError> {
        if src.len() < CHUNK_HEADER_SIZE {
            return Err(ProtocolError::IncompleteFrame {
                expected: CHUNK_HEADER_SIZE,
                actual: src.len(),
            });
        }
        if src[0] != CHUNK_VERSION {
            return Err(ProtocolError::UnsupportedVersion(src[0]));
        }

        src.advance(1);
        let frame_id = src.get_u64();
        let index = src.get_u16();
        let count = src.get_u16();
        if count == 0 || index >= count {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            frame_id,
            index,
            count,
            data: src,
        })
    }
}

/// Cut an encoded frame into messages of at most `max_message` bytes
pub fn split_frame(
    frame_id: u64,
    frame: &Bytes,
    max_message: usize,
) -> Result<Vec<Bytes>, ProtocolError> {
    if max_message <= CHUNK_HEADER_SIZE {
        return Err(ProtocolError::InvalidHeader);
    }
    let piece = max_message - CHUNK_HEADER_SIZE;
    let count = frame.len().div_ceil(piece).max(1);
    if count > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: frame.len(),
            max: piece * u16::MAX as usize,
        });
    }

    let mut messages = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * piece;
        let end = (start + piece).min(frame.len());
        messages.push(
            FrameChunk {
                frame_id,
                index: index as u16,
                count: count as u16,
                data: frame.slice(start..end),
            }
            .to_bytes(),
        );
    }
    Ok(messages)
}

/// Rebuilds frames from pieces received on one link
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    frame_id: Option<u64>,
    pieces: Vec<Option<Bytes>>,
    received: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a piece. Returns the encoded frame once its last piece arrives.
    pub fn push(&mut self, chunk: FrameChunk) -> Option<Bytes> {
        match self.frame_id {
            Some(current) if chunk.frame_id < current => return None,
            Some(current) if chunk.frame_id == current => {
                if self.pieces.len() != chunk.count as usize {
                    return None;
                }
            }
            _ => {
                if self.received > 0 && self.received < self.pieces.len() {
                    tracing::trace!(
                        "Dropping incomplete frame {:?} ({}/{} pieces)",
                        self.frame_id,
                        self.received,
                        self.pieces.len()
                    );
                }
                self.frame_id = Some(chunk.frame_id);
                self.pieces = vec![None; chunk.count as usize];
                self.received = 0;
            }
        }

        let slot = &mut self.pieces[chunk.index as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(chunk.data);
        self.received += 1;
        if self.received < self.pieces.len() {
            return None;
        }

        let mut frame = BytesMut::new();
        for piece in self.pieces.iter_mut() {
            if let Some(data) = piece.take() {
                frame.put_slice(&data);
            }
        }
        // Keep the id so late duplicates of this frame are ignored
        self.received = 0;
        self.pieces.clear();
        Some(frame.freeze())
    }
}
