//! Message framing
//!
//! Decodes a continuous byte stream into discrete length-prefixed
//! messages. The framer is restartable and keeps a partial-frame
//! remainder across writes, so messages may be split at arbitrary
//! byte boundaries and several complete messages may arrive per read.

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::SlskError;

/// One decoded wire frame: `[u32 length][u32 code][payload]` with the
/// length counting bytes after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message code
    pub code: u32,
    /// Raw payload after the code
    pub payload: Bytes,
}

impl Frame {
    /// Encode a full frame from a code and payload
    pub fn encode(code: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.extend_from_slice(&((payload.len() as u32 + 4).to_le_bytes()));
        buf.extend_from_slice(&code.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

/// Streaming frame decoder
#[derive(Debug)]
pub struct MessageFramer {
    /// Bytes carried over between pushes
    buffer: BytesMut,
    /// Largest acceptable frame; a bigger length prefix is a protocol error
    max_frame_size: usize,
}

impl MessageFramer {
    /// Create a new framer
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Feed a chunk of bytes and drain every complete frame, in
    /// arrival order. Incomplete trailing bytes are stashed for the
    /// next push.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }

            let length =
                u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if length < 4 {
                return Err(SlskError::protocol_error_with_source(
                    "Frame length too short to hold a message code",
                    format!("length: {}", length),
                )
                .into());
            }

            if length > self.max_frame_size {
                return Err(SlskError::protocol_error_with_source(
                    "Frame exceeds maximum size",
                    format!("length: {}, max: {}", length, self.max_frame_size),
                )
                .into());
            }

            if self.buffer.len() < 4 + length {
                break;
            }

            let mut frame = self.buffer.split_to(4 + length).freeze();
            frame.advance(4);
            let code = frame.get_u32_le();
            trace!("Framed message: code={}, payload={} bytes", code, frame.len());
            frames.push(Frame {
                code,
                payload: frame,
            });
        }

        Ok(frames)
    }

    /// Clear the remainder, discarding a stale partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently stashed waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> (Vec<u8>, Vec<Frame>) {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for (code, payload) in [
            (1u32, b"hello".to_vec()),
            (26, vec![]),
            (40, vec![0xde, 0xad, 0xbe, 0xef, 0x01]),
            (9, b"a longer payload with some content in it".to_vec()),
        ] {
            stream.extend_from_slice(&Frame::encode(code, &payload));
            expected.push(Frame {
                code,
                payload: Bytes::from(payload),
            });
        }
        (stream, expected)
    }

    #[test]
    fn test_single_push_yields_all_frames() {
        let (stream, expected) = sample_frames();
        let mut framer = MessageFramer::new(1024);
        let frames = framer.push(&stream).unwrap();
        assert_eq!(frames, expected);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let (stream, expected) = sample_frames();
        let mut framer = MessageFramer::new(1024);
        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(framer.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames, expected);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_every_split_point() {
        let (stream, expected) = sample_frames();
        for split in 0..=stream.len() {
            let mut framer = MessageFramer::new(1024);
            let mut frames = framer.push(&stream[..split]).unwrap();
            frames.extend(framer.push(&stream[split..]).unwrap());
            assert_eq!(frames, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_partial_frame_stashed() {
        let mut framer = MessageFramer::new(1024);
        let encoded = Frame::encode(7, b"payload");
        let frames = framer.push(&encoded[..6]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(framer.pending(), 6);

        let frames = framer.push(&encoded[6..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code, 7);
        assert_eq!(&frames[0].payload[..], b"payload");
    }

    #[test]
    fn test_reset_discards_remainder() {
        let mut framer = MessageFramer::new(1024);
        let encoded = Frame::encode(7, b"payload");
        framer.push(&encoded[..6]).unwrap();
        assert!(framer.pending() > 0);

        framer.reset();
        assert_eq!(framer.pending(), 0);

        // A fresh full frame still decodes after the reset
        let frames = framer.push(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut framer = MessageFramer::new(64);
        let mut stream = Vec::new();
        stream.extend_from_slice(&1000u32.to_le_bytes());
        stream.extend_from_slice(&1u32.to_le_bytes());
        assert!(framer.push(&stream).is_err());
    }

    #[test]
    fn test_undersized_length_rejected() {
        let mut framer = MessageFramer::new(64);
        let mut stream = Vec::new();
        stream.extend_from_slice(&2u32.to_le_bytes());
        assert!(framer.push(&stream).is_err());
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut framer = MessageFramer::new(64);
        let frames = framer.push(&Frame::encode(28, &[])).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code, 28);
        assert!(frames[0].payload.is_empty());
    }
}
