//! Outbound write path shared by handlers and the server.

use crate::codec::CodecPipeline;
use crate::error::ServerError;
use crate::session::{BroadcastReport, Session, SessionId, SessionRegistry};
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Encodes messages and hands frames to the transport, accounting each frame
/// against the session's scheduled-write limit until it is flushed.
pub(crate) struct Outbound<M> {
    registry: Arc<SessionRegistry>,
    codec: Arc<CodecPipeline<M>>,
    transport: Arc<dyn Transport>,
}

impl<M> Clone for Outbound<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            codec: Arc::clone(&self.codec),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<M: Send + 'static> Outbound<M> {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        codec: Arc<CodecPipeline<M>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            codec,
            transport,
        }
    }

    pub(crate) fn send(&self, id: SessionId, message: &M) -> Result<(), ServerError> {
        let session = self
            .registry
            .get(id)
            .ok_or(ServerError::SessionNotFound(id))?;
        let frame = self.codec.encode(message).map_err(|e| {
            warn!(session_id = %id, "⚠️ Dropping message that failed to encode: {}", e);
            ServerError::Codec(e)
        })?;
        self.write_frame(&session, frame)
    }

    /// Encodes once and writes the same frame to every registered session.
    pub(crate) fn broadcast(&self, message: &M) -> Result<BroadcastReport, ServerError> {
        let frame = self.codec.encode(message).map_err(|e| {
            warn!("⚠️ Dropping broadcast that failed to encode: {}", e);
            ServerError::Codec(e)
        })?;
        Ok(self
            .registry
            .broadcast(&frame, |session, frame| self.write_frame(session, frame)))
    }

    pub(crate) fn close(&self, id: SessionId) -> Result<(), ServerError> {
        self.transport.close(id).map_err(ServerError::from_transport)
    }

    pub(crate) fn session_count(&self) -> usize {
        self.registry.count()
    }

    fn write_frame(&self, session: &Session, frame: Bytes) -> Result<(), ServerError> {
        self.codec.reserve_write(session)?;
        if let Err(e) = self.transport.write(session.id(), frame) {
            self.codec.complete_write(session);
            return Err(ServerError::from_transport(e));
        }
        Ok(())
    }
}
