//! Per-session codec state and write accounting.

use super::{CodecError, CodecFactory, CodecLimits, Decoder, Encoder};
use crate::error::ServerError;
use crate::session::{Session, SessionId};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// A decode error together with the messages that decoded before it.
#[derive(Debug)]
pub struct DecodeFailure<M> {
    pub decoded: Vec<M>,
    pub error: CodecError,
}

struct SessionDecoder<M> {
    decoder: Box<dyn Decoder<Item = M>>,
    buffer: BytesMut,
}

/// Decodes inbound bytes per session and encodes outbound messages.
///
/// Each session gets its own decoder and read buffer, created lazily on its
/// first data. The buffer of undecoded bytes never grows past
/// `max_read_frame_size`.
pub struct CodecPipeline<M> {
    factory: Arc<dyn CodecFactory<Message = M>>,
    encoder: Arc<dyn Encoder<Item = M>>,
    limits: CodecLimits,
    decoders: DashMap<SessionId, Mutex<SessionDecoder<M>>>,
}

impl<M: Send + 'static> CodecPipeline<M> {
    pub fn new(factory: Arc<dyn CodecFactory<Message = M>>, limits: CodecLimits) -> Self {
        let encoder = factory.encoder(&limits);
        Self {
            factory,
            encoder,
            limits,
            decoders: DashMap::new(),
        }
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    /// Appends `data` to the session's buffer and returns every complete message.
    ///
    /// Partial frames are kept for the next call. On error the messages that
    /// decoded before it are handed back with it, and the session's state is
    /// left as is; the caller is expected to close the session.
    pub fn decode(&self, id: SessionId, data: &[u8]) -> Result<Vec<M>, DecodeFailure<M>> {
        // Only the first read of a session takes the shard write lock.
        let entry = match self.decoders.get(&id) {
            Some(entry) => entry,
            None => self
                .decoders
                .entry(id)
                .or_insert_with(|| {
                    Mutex::new(SessionDecoder {
                        decoder: self.factory.decoder(&self.limits),
                        buffer: BytesMut::new(),
                    })
                })
                .downgrade(),
        };
        let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let SessionDecoder { decoder, buffer } = &mut *state;

        let max = self.limits.max_read_frame_size;
        buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        let error = loop {
            match decoder.decode(buffer) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) if buffer.len() > max => {
                    break CodecError::FrameTooLarge {
                        size: buffer.len(),
                        max,
                    }
                }
                Ok(None) => {
                    trace!(session_id = %id, "Decoded {} messages, {} bytes pending", messages.len(), buffer.len());
                    return Ok(messages);
                }
                Err(e) => break e,
            }
        };
        Err(DecodeFailure {
            decoded: messages,
            error,
        })
    }

    /// Encodes one message into a standalone frame.
    pub fn encode(&self, message: &M) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::new();
        self.encoder.encode(message, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Reserves a scheduled-write slot on the session.
    pub fn reserve_write(&self, session: &Session) -> Result<(), ServerError> {
        if session.try_schedule_write(self.limits.max_scheduled_writes) {
            Ok(())
        } else {
            Err(ServerError::WriteBackpressure {
                session_id: session.id(),
                limit: self.limits.max_scheduled_writes,
            })
        }
    }

    /// Releases a slot once the transport has flushed (or dropped) a frame.
    pub fn complete_write(&self, session: &Session) {
        session.complete_write();
    }

    /// Drops a closed session's decoder state.
    pub fn release(&self, id: SessionId) {
        self.decoders.remove(&id);
    }

    /// Drops every session's decoder state.
    pub fn clear(&self) {
        self.decoders.clear();
    }

    /// Number of sessions with decoder state.
    pub fn tracked_sessions(&self) -> usize {
        self.decoders.len()
    }
}
