//! Length-prefixed framing: a 4-byte big-endian length followed by the payload.

use super::{CodecError, CodecFactory, CodecLimits, Decoder, Encoder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default codec; messages are raw [`Bytes`] payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthDelimited;

impl CodecFactory for LengthDelimited {
    type Message = Bytes;

    fn decoder(&self, limits: &CodecLimits) -> Box<dyn Decoder<Item = Bytes>> {
        Box::new(LengthDelimitedDecoder::new(limits.max_read_frame_size))
    }

    fn encoder(&self, _limits: &CodecLimits) -> Arc<dyn Encoder<Item = Bytes>> {
        Arc::new(LengthDelimitedEncoder)
    }
}

/// Splits frames out of the byte stream.
///
/// `max_frame` bounds the whole frame including the header, so a frame whose
/// declared length can never fit is rejected as soon as its header arrives.
#[derive(Debug, Clone)]
pub struct LengthDelimitedDecoder {
    max_frame: usize,
}

impl LengthDelimitedDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for LengthDelimitedDecoder {
    type Item = Bytes;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let frame = HEADER_LEN.saturating_add(len);
        if frame > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                size: frame,
                max: self.max_frame,
            });
        }
        if src.len() < frame {
            src.reserve(frame - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LengthDelimitedEncoder;

impl Encoder for LengthDelimitedEncoder {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        write_frame(item, dst)
    }
}

/// Appends `payload` to `dst` with its length prefix.
pub(crate) fn write_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CodecError::Encode(format!("payload of {} bytes cannot be length-prefixed", payload.len()))
    })?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}
