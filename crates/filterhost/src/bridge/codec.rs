//! Framed codec for the helper channel.
//!
//! A frame is a 4-byte little-endian length followed by that many payload
//! bytes. Payloads are opaque here; the protocol module gives them meaning.
//! Works over any AsyncRead/AsyncWrite (sockets, named pipes).

use std::io;

use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default cap on a single frame payload (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {length} exceeds limit of {max} bytes")]
    TooLarge { length: usize, max: usize },

    #[error("channel closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed frame codec.
///
/// Decoding peeks at the prefix and rejects oversized lengths before reserving
/// any memory; nothing is consumed from the buffer until a whole frame is
/// present, so a partial frame at end of stream is reported as truncated.
/// Encoding goes through LengthDelimitedCodec configured for little-endian
/// 4-byte prefixes.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .little_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let length = u32::from_le_bytes(prefix) as usize;

        if length > self.max_frame_length {
            return Err(FrameError::TooLarge {
                length,
                max: self.max_frame_length,
            });
        }

        let total = LENGTH_PREFIX_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = payload.len();
        if length > self.max_frame_length {
            return Err(FrameError::TooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        tracing::trace!(frame_size_bytes = length, "Encoding frame");
        self.inner.encode(payload, dst)?;
        Ok(())
    }
}

/// Encode a single payload into a standalone frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    codec.encode(Bytes::copy_from_slice(payload), &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn prefix_is_little_endian() {
        let frame = encode_frame(&[0xAA; 258]).unwrap();
        assert_eq!(&frame[..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(frame.len(), 4 + 258);
    }

    #[test]
    fn payloads_survive_framing_across_lengths() {
        let mut codec = FrameCodec::new();
        for len in [0usize, 1, 2, 127, 128, 255, 256, 4096, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let mut buf = BytesMut::from(&encode_frame(&payload).unwrap()[..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded[..], &payload[..], "length {len}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn empty_payload_is_a_frame_not_end_of_stream() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let frame = codec.decode_eof(&mut buf).unwrap();
        assert_eq!(frame, Some(Bytes::new()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = FrameCodec::new();
        let frame = encode_frame(b"hello").unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[2..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[6..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"one").unwrap());
        buf.extend_from_slice(&encode_frame(b"").unwrap());
        buf.extend_from_slice(&encode_frame(b"three").unwrap());

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"one"),
                Bytes::new(),
                Bytes::from_static(b"three")
            ]
        );
    }

    #[test]
    fn oversized_length_fails_before_allocating() {
        let mut codec = FrameCodec::with_max_frame_length(16);
        let mut buf = BytesMut::from(&u32::MAX.to_le_bytes()[..]);
        let capacity_before = buf.capacity();

        match codec.decode(&mut buf) {
            Err(FrameError::TooLarge { length, max }) => {
                assert_eq!(length, u32::MAX as usize);
                assert_eq!(max, 16);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert_eq!(buf.capacity(), capacity_before);
    }

    #[test]
    fn encoding_over_limit_is_rejected() {
        let mut codec = FrameCodec::with_max_frame_length(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(b"too long"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { length: 8, max: 4 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_at_eof_is_truncated() {
        let mut codec = FrameCodec::new();
        let frame = encode_frame(b"hello").unwrap();
        let mut buf = BytesMut::from(&frame[..7]);

        match codec.decode_eof(&mut buf) {
            Err(FrameError::Truncated { buffered }) => assert_eq!(buffered, 7),
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn partial_prefix_at_eof_is_truncated() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[5u8, 0][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::Truncated { buffered: 2 })
        ));
    }
}
