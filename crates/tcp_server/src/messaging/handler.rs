use super::Outbound;
use crate::error::ServerError;
use crate::session::{BroadcastReport, SessionId, SessionInfo};
use crate::transport::IdleStatus;
use std::net::SocketAddr;

/// Application callbacks for session events.
///
/// Only [`on_message`](Self::on_message) is required. An `Err` returned from
/// any hook is logged and does not affect the session or later messages;
/// a panic is caught and treated the same way.
///
/// Any `Fn(&SessionContext<M>, M) -> anyhow::Result<()>` closure is a handler.
pub trait MessageHandler<M>: Send + Sync + 'static {
    /// A decoded message arrived.
    fn on_message(&self, ctx: &SessionContext<M>, message: M) -> anyhow::Result<()>;

    /// The session was accepted and can be written to.
    fn on_open(&self, _ctx: &SessionContext<M>) -> anyhow::Result<()> {
        Ok(())
    }

    /// An idle timer fired. Whether the session is then closed depends on
    /// the configured `IdleAction`.
    fn on_idle(&self, _ctx: &SessionContext<M>, _status: IdleStatus) -> anyhow::Result<()> {
        Ok(())
    }

    /// The session is closed; writes through `ctx` will fail.
    fn on_close(&self, _ctx: &SessionContext<M>) {}

    /// Decoding or I/O failed for the session. The session is closed afterwards.
    fn on_error(&self, _ctx: &SessionContext<M>, _error: &ServerError) {}
}

impl<M, F> MessageHandler<M> for F
where
    F: Fn(&SessionContext<M>, M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, ctx: &SessionContext<M>, message: M) -> anyhow::Result<()> {
        self(ctx, message)
    }
}

/// Handle to the session a callback is running for.
pub struct SessionContext<M> {
    info: SessionInfo,
    outbound: Outbound<M>,
}

impl<M: Send + 'static> SessionContext<M> {
    pub(crate) fn new(info: SessionInfo, outbound: Outbound<M>) -> Self {
        Self { info, outbound }
    }

    pub fn id(&self) -> SessionId {
        self.info.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    pub fn info(&self) -> SessionInfo {
        self.info
    }

    /// Encodes and queues a message for this session.
    pub fn write(&self, message: &M) -> Result<(), ServerError> {
        self.outbound.send(self.info.id, message)
    }

    /// Encodes and queues a message for another session.
    pub fn write_to(&self, id: SessionId, message: &M) -> Result<(), ServerError> {
        self.outbound.send(id, message)
    }

    /// Closes this session once already queued writes are flushed.
    pub fn close(&self) -> Result<(), ServerError> {
        self.outbound.close(self.info.id)
    }

    /// Sends a message to every live session, this one included.
    pub fn broadcast(&self, message: &M) -> Result<BroadcastReport, ServerError> {
        self.outbound.broadcast(message)
    }

    /// Number of sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.outbound.session_count()
    }
}

impl<M> std::fmt::Debug for SessionContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").field("info", &self.info).finish()
    }
}
