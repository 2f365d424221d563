//! Bridges transport events to the codec pipeline and the dispatcher.
//!
//! Transport callbacks run on I/O tasks and stay short: bookkeeping and
//! decoding happen inline, every handler callback is queued on the
//! dispatcher under the session's id so it runs in event order.

use crate::codec::CodecPipeline;
use crate::config::IdleAction;
use crate::dispatcher::OrderedDispatcher;
use crate::error::ServerError;
use crate::messaging::{MessageHandler, Outbound, SessionContext};
use crate::session::{SessionId, SessionInfo, SessionRegistry};
use crate::transport::{Flow, IdleStatus, TransportError, TransportEvents};
use anyhow::Context;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// [`TransportEvents`] sink for one running server.
pub(crate) struct SessionEvents<M> {
    pub registry: Arc<SessionRegistry>,
    pub codec: Arc<CodecPipeline<M>>,
    pub dispatcher: Arc<OrderedDispatcher>,
    pub handler: Arc<dyn MessageHandler<M>>,
    pub outbound: Outbound<M>,
    pub idle_action: IdleAction,
}

impl<M: Send + 'static> SessionEvents<M> {
    /// Queues a handler callback on the session's worker.
    ///
    /// Returns `false` if the dispatcher no longer accepts work.
    fn dispatch<F>(&self, info: SessionInfo, event: &'static str, callback: F) -> bool
    where
        F: FnOnce(&dyn MessageHandler<M>, &SessionContext<M>) -> anyhow::Result<()> + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let ctx = SessionContext::new(info, self.outbound.clone());
        let job = Box::new(move || {
            callback(handler.as_ref(), &ctx)
                .with_context(|| format!("{} handler failed for session {}", event, ctx.id()))
        });

        match self.dispatcher.dispatch(info.id.0, job) {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id = %info.id, "Dropped {} event: {}", event, e);
                false
            }
        }
    }

    fn dispatch_message(&self, info: SessionInfo, message: M) {
        self.dispatch(info, "message", move |handler, ctx| handler.on_message(ctx, message));
    }

    fn info(&self, id: SessionId) -> Option<SessionInfo> {
        self.registry.get(id).map(|session| session.info())
    }
}

impl<M: Send + 'static> TransportEvents for SessionEvents<M> {
    fn on_accept(&self, remote_addr: SocketAddr) -> SessionId {
        self.registry.admit(remote_addr)
    }

    fn on_open(&self, id: SessionId) {
        if let Some(session) = self.registry.activate(id) {
            self.dispatch(session.info(), "open", |handler, ctx| handler.on_open(ctx));
        }
    }

    fn on_data(&self, id: SessionId, data: &[u8]) -> Flow {
        let Some(session) = self.registry.get(id) else {
            trace!(session_id = %id, "Ignoring data for closed session");
            return Flow::Close;
        };
        session.touch_read();

        match self.codec.decode(id, data) {
            Ok(messages) => {
                for message in messages {
                    self.dispatch_message(session.info(), message);
                }
                Flow::Continue
            }
            Err(failure) => {
                // Frames completed before the bad one are still delivered.
                for message in failure.decoded {
                    self.dispatch_message(session.info(), message);
                }
                warn!(session_id = %id, "⚠️ Closing session after codec error: {}", failure.error);
                let error = ServerError::Codec(failure.error);
                self.dispatch(session.info(), "error", move |handler, ctx| {
                    handler.on_error(ctx, &error);
                    Ok(())
                });
                Flow::Close
            }
        }
    }

    fn on_idle(&self, id: SessionId, status: IdleStatus) -> Flow {
        let Some(info) = self.info(id) else {
            return Flow::Close;
        };
        trace!(session_id = %id, "Session idle ({:?})", status);
        self.dispatch(info, "idle", move |handler, ctx| handler.on_idle(ctx, status));

        match self.idle_action {
            IdleAction::Notify => Flow::Continue,
            IdleAction::Close => {
                debug!(session_id = %id, "Closing session idle on {:?}", status);
                Flow::Close
            }
        }
    }

    fn on_written(&self, id: SessionId) {
        if let Some(session) = self.registry.get(id) {
            session.touch_write();
            self.codec.complete_write(&session);
        }
    }

    fn on_close(&self, id: SessionId) {
        self.codec.release(id);
        let Some(session) = self.registry.unregister(id) else {
            return;
        };
        let info = session.info();
        let close = |handler: &dyn MessageHandler<M>, ctx: &SessionContext<M>| -> anyhow::Result<()> {
            handler.on_close(ctx);
            Ok(())
        };
        if self.dispatch(info, "close", close) {
            return;
        }

        // The workers are gone once the server is stopping; run the hook here.
        let ctx = SessionContext::new(info, self.outbound.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| close(self.handler.as_ref(), &ctx)));
        if outcome.is_err() {
            error!(session_id = %id, "💥 close handler panicked");
        }
    }

    fn on_error(&self, id: SessionId, error: &std::io::Error) {
        let Some(info) = self.info(id) else {
            return;
        };
        debug!(session_id = %id, "I/O error: {}", error);
        let error = ServerError::Transport(TransportError::Io(std::io::Error::new(
            error.kind(),
            error.to_string(),
        )));
        self.dispatch(info, "error", move |handler, ctx| {
            handler.on_error(ctx, &error);
            Ok(())
        });
    }
}
