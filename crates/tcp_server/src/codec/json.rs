//! JSON messages carried in length-delimited frames.

use super::length_delimited::{write_frame, LengthDelimitedDecoder};
use super::{CodecError, CodecFactory, CodecLimits, Decoder, Encoder};
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Codec for any serde type, one JSON document per frame.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tcp_server::{JsonCodec, ServerConfig, TcpServer};
///
/// #[derive(Serialize, Deserialize)]
/// struct Chat { text: String }
///
/// let server = TcpServer::with_codec(
///     ServerConfig::default(),
///     |ctx: &tcp_server::SessionContext<Chat>, msg: Chat| -> anyhow::Result<()> {
///         ctx.broadcast(&msg)?;
///         Ok(())
///     },
///     JsonCodec::<Chat>::new(),
/// );
/// assert!(server.is_ok());
/// ```
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<T> CodecFactory for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Message = T;

    fn decoder(&self, limits: &CodecLimits) -> Box<dyn Decoder<Item = T>> {
        Box::new(JsonDecoder {
            frames: LengthDelimitedDecoder::new(limits.max_read_frame_size),
            _marker: PhantomData,
        })
    }

    fn encoder(&self, _limits: &CodecLimits) -> Arc<dyn Encoder<Item = T>> {
        Arc::new(JsonEncoder { _marker: PhantomData })
    }
}

struct JsonDecoder<T> {
    frames: LengthDelimitedDecoder,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Decoder for JsonDecoder<T> {
    type Item = T;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| CodecError::Decode(e.to_string())),
            None => Ok(None),
        }
    }
}

struct JsonEncoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize> Encoder for JsonEncoder<T> {
    type Item = T;

    fn encode(&self, item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(item).map_err(|e| CodecError::Encode(e.to_string()))?;
        write_frame(&payload, dst)
    }
}
