//! Pluggable wire codecs.
//!
//! A [`CodecFactory`] supplies one stateful [`Decoder`] per session and a
//! single shared [`Encoder`]. The [`CodecPipeline`] wires them to sessions and
//! enforces the configured [`CodecLimits`].

mod json;
mod length_delimited;
mod pipeline;

pub use json::JsonCodec;
pub use length_delimited::{LengthDelimited, LengthDelimitedDecoder, LengthDelimitedEncoder, HEADER_LEN};
pub use pipeline::{CodecPipeline, DecodeFailure};

use bytes::BytesMut;
use std::sync::Arc;

/// Limits applied while decoding and writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Maximum number of undecoded bytes buffered for one session.
    pub max_read_frame_size: usize,
    /// Maximum encoded-but-unflushed frames per session (0 = unlimited).
    pub max_scheduled_writes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_read_frame_size: 64 * 1024,
            max_scheduled_writes: 1024,
        }
    }
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Stateful per-session decoder.
///
/// `decode` is called with the session's accumulated bytes. It consumes one
/// complete frame and returns the message, or returns `Ok(None)` and leaves
/// the buffer untouched when more data is needed.
pub trait Decoder: Send {
    type Item;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, CodecError>;
}

/// Stateless encoder shared by every session.
pub trait Encoder: Send + Sync {
    type Item;

    fn encode(&self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), CodecError>;
}

/// Produces the decoder and encoder for one message type.
pub trait CodecFactory: Send + Sync + 'static {
    type Message: Send + 'static;

    fn decoder(&self, limits: &CodecLimits) -> Box<dyn Decoder<Item = Self::Message>>;

    fn encoder(&self, limits: &CodecLimits) -> Arc<dyn Encoder<Item = Self::Message>>;
}
