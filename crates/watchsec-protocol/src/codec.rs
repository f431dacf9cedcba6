//! Tokio codec for recorded stream frames
//!
//! Recordings are a plain sequence of length-prefixed frames:
//! - length: 4 bytes (u32, big-endian) of the encoded frame that follows
//! - frame: a [`StreamFrame`] in its wire encoding

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{StreamFrame, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Size of the record length prefix
const LENGTH_PREFIX: usize = 4;

/// Codec for encoding/decoding recorded frames
#[derive(Debug, Default)]
pub struct RecordingCodec {
    /// Length of the record being decoded (if already read)
    pending_len: Option<usize>,
}

impl RecordingCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for RecordingCodec {
    type Item = StreamFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let record_len = match self.pending_len.take() {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX {
                    return Ok(None);
                }
                src.get_u32() as usize
            }
        };

        if record_len < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        if record_len > MAX_PAYLOAD_SIZE + HEADER_SIZE + u8::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: record_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < record_len {
            // Save length and wait for more data
            self.pending_len = Some(record_len);
            src.reserve(record_len - src.len());
            return Ok(None);
        }

        let record = src.split_to(record_len).freeze();
        StreamFrame::decode(record).map(Some)
    }
}

impl Encoder<StreamFrame> for RecordingCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: StreamFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(LENGTH_PREFIX + frame.encoded_len());
        dst.put_u32(frame.encoded_len() as u32);
        frame.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;
    use bytes::Bytes;

    fn frame(seq: u64) -> StreamFrame {
        StreamFrame::new(
            AgentId::new("rec-agent"),
            seq,
            1_000 + seq,
            Bytes::from(vec![seq as u8; 32]),
        )
    }

    #[test]
    fn test_codec_multiple_records() {
        let mut codec = RecordingCodec::new();
        let mut buf = BytesMut::new();
        for seq in 1..=3 {
            codec.encode(frame(seq), &mut buf).unwrap();
        }

        for seq in 1..=3 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.sequence, seq);
            assert_eq!(decoded.payload.len(), 32);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = RecordingCodec::new();

        let mut full_buf = BytesMut::new();
        codec.encode(frame(7), &mut full_buf).unwrap();

        // Length prefix plus part of the header
        let mut partial = full_buf.split_to(LENGTH_PREFIX + 5);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame(7));
    }

    #[test]
    fn test_codec_rejects_short_record() {
        let mut codec = RecordingCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[1, 2, 3]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[tokio::test]
    async fn test_codec_with_framed_read() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let mut codec = RecordingCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame(1), &mut buf).unwrap();
        codec.encode(frame(2), &mut buf).unwrap();

        let reader = std::io::Cursor::new(buf.to_vec());
        let frames: Vec<_> = FramedRead::new(reader, RecordingCodec::new())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_ref().unwrap().sequence, 2);
    }
}
