//! Length-prefixed framing.
//!
//! Every unit on the wire is a 4-byte big-endian payload length followed by the payload. Outgoing frames are written
//! with [`encode_frame`], which reserves the prefix, lets the codec append the payload in place and then patches the
//! length. Incoming bytes are accumulated by a [`FrameAssembler`] which tracks a *watermark*: the number of buffered
//! bytes needed before the next frame is complete.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::CodecError,
    error::{Error, Result},
};

/// Size of the big-endian payload length in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Appends one length-prefixed frame to `dst`, with a payload produced by `encode`.
///
/// On failure `dst` is truncated back to its original length so a half-written frame never reaches the socket.
pub fn encode_frame<F>(dst: &mut BytesMut, max_frame_size: usize, encode: F) -> Result<usize>
where
    F: FnOnce(&mut BytesMut) -> Result<(), CodecError>,
{
    let start = dst.len();
    dst.put_u32(0);

    if let Err(err) = encode(dst) {
        dst.truncate(start);
        return Err(err.into());
    }

    let payload_len = dst.len() - start - LENGTH_PREFIX_LEN;
    if payload_len > max_frame_size || payload_len > u32::MAX as usize {
        dst.truncate(start);
        return Err(Error::FrameTooLarge {
            size: payload_len,
            max: max_frame_size,
        });
    }

    dst[start..start + LENGTH_PREFIX_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
    Ok(payload_len)
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
///
/// The assembler owns a single buffer; complete frames are split off it as [`Bytes`] without copying.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    watermark: usize,
    have_prefix: bool,
    max_frame_size: usize,
}

impl FrameAssembler {
    /// Creates an empty assembler rejecting frames above `max_frame_size` payload bytes.
    pub fn new(max_frame_size: usize) -> Self {
        FrameAssembler {
            buf: BytesMut::new(),
            watermark: LENGTH_PREFIX_LEN,
            have_prefix: false,
            max_frame_size,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes needed in the buffer before the next frame is complete.
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Splits off the next complete frame payload, if one is buffered.
    ///
    /// Returns [`Error::FrameTooLarge`] as soon as a length prefix announces an oversized frame; the assembler is
    /// unusable afterwards and the connection must be failed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < self.watermark {
            return Ok(None);
        }

        if !self.have_prefix {
            let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if size > self.max_frame_size {
                return Err(Error::FrameTooLarge {
                    size,
                    max: self.max_frame_size,
                });
            }
            self.have_prefix = true;
            self.watermark = LENGTH_PREFIX_LEN + size;
            if self.buf.len() < self.watermark {
                self.buf.reserve(self.watermark - self.buf.len());
                return Ok(None);
            }
        }

        let mut frame = self.buf.split_to(self.watermark);
        let payload = frame.split_off(LENGTH_PREFIX_LEN);
        self.watermark = LENGTH_PREFIX_LEN;
        self.have_prefix = false;
        Ok(Some(payload.freeze()))
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.watermark = LENGTH_PREFIX_LEN;
        self.have_prefix = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_frame(&mut out, usize::MAX, |dst| {
            dst.extend_from_slice(payload);
            Ok(())
        })
        .unwrap();
        out.to_vec()
    }

    fn drain(assembler: &mut FrameAssembler) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = assembler.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_frame_writes_big_endian_length() {
        let bytes = frame(b"hello");
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..], b"hello");
    }

    #[test]
    fn byte_by_byte_delivery_matches_single_read() {
        let mut stream = Vec::new();
        for payload in [&b"first"[..], b"", b"a much longer third payload", b"x"] {
            stream.extend(frame(payload));
        }

        let mut whole = FrameAssembler::new(1024);
        whole.extend(&stream);
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), 4);

        let mut chunked = FrameAssembler::new(1024);
        let mut got = Vec::new();
        for byte in &stream {
            chunked.extend(std::slice::from_ref(byte));
            got.extend(drain(&mut chunked));
        }
        assert_eq!(got, expected);
        assert_eq!(chunked.buffered(), 0);
    }

    #[test]
    fn uneven_chunks_reassemble() {
        let mut stream = Vec::new();
        for i in 0..20u8 {
            stream.extend(frame(&vec![i; i as usize * 7]));
        }

        for chunk_size in [2, 3, 5, 11, 64] {
            let mut assembler = FrameAssembler::new(1024);
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                assembler.extend(chunk);
                got.extend(drain(&mut assembler));
            }
            assert_eq!(got.len(), 20, "chunk size {chunk_size}");
            for (i, payload) in got.iter().enumerate() {
                assert_eq!(payload.len(), i * 7);
            }
        }
    }

    #[test]
    fn watermark_tracks_partial_frame() {
        let bytes = frame(b"0123456789");
        let mut assembler = FrameAssembler::new(1024);
        assert_eq!(assembler.watermark(), LENGTH_PREFIX_LEN);

        assembler.extend(&bytes[..6]);
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.watermark(), LENGTH_PREFIX_LEN + 10);

        assembler.extend(&bytes[6..]);
        assert_eq!(assembler.next_frame().unwrap().as_deref(), Some(&b"0123456789"[..]));
        assert_eq!(assembler.watermark(), LENGTH_PREFIX_LEN);
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut assembler = FrameAssembler::new(16);
        assembler.extend(&1000u32.to_be_bytes());
        assert_eq!(
            assembler.next_frame(),
            Err(Error::FrameTooLarge { size: 1000, max: 16 })
        );
    }

    #[test]
    fn failed_encode_leaves_buffer_untouched() {
        let mut out = BytesMut::from(&b"queued"[..]);
        let err = encode_frame(&mut out, 1024, |dst| {
            dst.extend_from_slice(b"partial");
            Err(CodecError::Unsupported("nope".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        assert_eq!(&out[..], b"queued");

        let err = encode_frame(&mut out, 2, |dst| {
            dst.extend_from_slice(b"too long");
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err, Error::FrameTooLarge { size: 8, max: 2 });
        assert_eq!(&out[..], b"queued");
    }
}
