//! Frame codec for the length-prefixed stream
//!
//! Splits a connection's byte stream into frames and writes frames back out.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {length} bytes (max: {max})")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Stream truncated with {buffered} bytes of an incomplete frame")]
    TruncatedStream { buffered: usize },
}

/// One complete length-prefixed unit of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Arrival index on the owning connection, starting at 0
    pub sequence: u64,
    payload: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        Self { sequence, payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Write a payload as a frame into a buffer
pub fn encode_frame(payload: &[u8], max_frame_size: usize, buf: &mut BytesMut) -> Result<(), FrameError> {
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            length: payload.len(),
            max: max_frame_size,
        });
    }

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Incremental frame decoder for one connection
///
/// Bytes are appended as they arrive, in chunks of any size. Frames are
/// only ever produced whole.
pub struct FrameReader {
    buf: BytesMut,
    state: ReadState,
    max_frame_size: usize,
    next_sequence: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    #[default]
    Header,
    Payload {
        length: usize,
    },
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        Self::with_capacity(max_frame_size, 4096)
    }

    pub fn with_capacity(max_frame_size: usize, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            state: ReadState::Header,
            max_frame_size,
            next_sequence: 0,
        }
    }

    /// Append a chunk of received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Direct access to the accumulation buffer, for reading sockets into it
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet emitted as part of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True when no bytes of a following frame have been consumed
    pub fn at_boundary(&self) -> bool {
        self.state == ReadState::Header && self.buf.is_empty()
    }

    /// Attempt to take the next complete frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                ReadState::Header => {
                    if self.buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
                    if length > self.max_frame_size {
                        return Err(FrameError::FrameTooLarge {
                            length,
                            max: self.max_frame_size,
                        });
                    }

                    self.buf.advance(HEADER_SIZE);
                    self.state = ReadState::Payload { length };
                }
                ReadState::Payload { length } => {
                    if self.buf.len() < length {
                        // Reserve up front so a large frame doesn't regrow the buffer per chunk
                        self.buf.reserve(length - self.buf.len());
                        return Ok(None);
                    }

                    let payload = self.buf.split_to(length).freeze();
                    let sequence = self.next_sequence;
                    self.next_sequence += 1;
                    self.state = ReadState::Header;

                    return Ok(Some(Frame::new(sequence, payload)));
                }
            }
        }
    }

    /// Check the end of the stream. A close between frames is clean.
    pub fn finish(&self) -> Result<(), FrameError> {
        match self.state {
            ReadState::Header if self.buf.is_empty() => Ok(()),
            ReadState::Header => Err(FrameError::TruncatedStream {
                buffered: self.buf.len(),
            }),
            ReadState::Payload { .. } => Err(FrameError::TruncatedStream {
                buffered: HEADER_SIZE + self.buf.len(),
            }),
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(payload, DEFAULT_MAX_FRAME_SIZE, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_single_frame() {
        let mut reader = FrameReader::default();
        reader.extend(&framed(b"hello"));

        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.sequence, 0);
        assert!(reader.next_frame().unwrap().is_none());
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_header_is_big_endian() {
        let bytes = framed(&[0u8; 0x2F]);
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0x00, 0x2F]);
    }

    #[test]
    fn test_every_split_point_yields_same_frame() {
        let payload: Vec<u8> = (0u8..40).collect();
        let bytes = framed(&payload);

        for split in 1..bytes.len() {
            let mut reader = FrameReader::default();
            reader.extend(&bytes[..split]);
            assert!(reader.next_frame().unwrap().is_none(), "early frame at split {}", split);
            reader.extend(&bytes[split..]);

            let frame = reader.next_frame().unwrap().unwrap();
            assert_eq!(frame.payload(), payload.as_slice());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = framed(b"one byte at a time");
        let mut reader = FrameReader::default();
        let mut frames = Vec::new();

        for b in &bytes {
            reader.extend(std::slice::from_ref(b));
            while let Some(frame) = reader.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"one byte at a time");
    }

    #[test]
    fn test_zero_length_frame() {
        let mut reader = FrameReader::default();
        reader.extend(&[0, 0, 0, 0]);

        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(reader.at_boundary());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = framed(b"a");
        bytes.extend(framed(b""));
        bytes.extend(framed(b"ccc"));

        let mut reader = FrameReader::default();
        reader.extend(&bytes);

        let sequences: Vec<(u64, usize)> = std::iter::from_fn(|| reader.next_frame().unwrap())
            .map(|f| (f.sequence, f.len()))
            .collect();
        assert_eq!(sequences, vec![(0, 1), (1, 0), (2, 3)]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reader = FrameReader::new(8);
        reader.extend(&[0, 0, 0, 9, 1, 2, 3]);

        assert_eq!(
            reader.next_frame(),
            Err(FrameError::FrameTooLarge { length: 9, max: 8 })
        );
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        let result = encode_frame(&[0u8; 9], 8, &mut buf);
        assert!(matches!(result, Err(FrameError::FrameTooLarge { length: 9, max: 8 })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_header() {
        let mut reader = FrameReader::default();
        reader.extend(&[0, 0]);
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.finish(), Err(FrameError::TruncatedStream { buffered: 2 }));
    }

    #[test]
    fn test_truncated_payload() {
        let mut reader = FrameReader::default();
        reader.extend(&[0, 0, 0, 5, b'a', b'b']);
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.finish(), Err(FrameError::TruncatedStream { buffered: 6 }));
    }
}
