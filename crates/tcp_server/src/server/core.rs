//! Core server implementation.
//!
//! This module contains the [`TcpServer`] struct, which wires the transport,
//! codec pipeline, ordered dispatcher and session registry together and
//! drives them through the Stopped → Starting → Running → Stopping → Stopped
//! lifecycle.

use crate::codec::{CodecFactory, CodecPipeline, LengthDelimited};
use crate::config::ServerConfig;
use crate::dispatcher::OrderedDispatcher;
use crate::error::ServerError;
use crate::messaging::{MessageHandler, Outbound};
use crate::server::handlers::SessionEvents;
use crate::session::{BroadcastReport, SessionId, SessionInfo, SessionRegistry};
use crate::transport::{TcpTransport, Transport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`TcpServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Resources that only exist while the server is running.
enum Lifecycle<M> {
    Stopped,
    Running {
        local_addr: SocketAddr,
        dispatcher: Arc<OrderedDispatcher>,
        codec: Arc<CodecPipeline<M>>,
    },
}

/// What the synchronous accessors need from a running server.
struct Active<M> {
    local_addr: SocketAddr,
    outbound: Outbound<M>,
}

/// Ordered TCP server.
///
/// Accepts connections, decodes each connection's byte stream with the
/// configured codec, and hands the messages to the [`MessageHandler`].
/// Messages from one session are handled one at a time, in arrival order;
/// different sessions are handled concurrently on the worker pool.
///
/// `start` and `stop` are serialised by a per-instance lock and are
/// idempotent: starting a running server returns its address, stopping a
/// stopped server does nothing. A stopped server can be started again.
///
/// # Examples
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use tcp_server::{ServerConfig, SessionContext, TcpServer};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::builder().port(9000).build()?;
/// let server = TcpServer::new(config, |ctx: &SessionContext<Bytes>, msg: Bytes| -> anyhow::Result<()> {
///     ctx.write(&msg)?;
///     Ok(())
/// })?;
///
/// let addr = server.start().await?;
/// println!("echo server on {addr}");
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct TcpServer<M = Bytes> {
    config: Arc<ServerConfig>,
    handler: Arc<dyn MessageHandler<M>>,
    codec: Arc<dyn CodecFactory<Message = M>>,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    lifecycle: Mutex<Lifecycle<M>>,
    state: AtomicU8,
    active: RwLock<Option<Active<M>>>,
}

impl TcpServer<Bytes> {
    /// Creates a server exchanging raw length-delimited frames over TCP.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the configuration is invalid.
    pub fn new<H>(config: ServerConfig, handler: H) -> Result<Self, ServerError>
    where
        H: MessageHandler<Bytes>,
    {
        Self::with_codec(config, handler, LengthDelimited)
    }
}

impl<M: Send + 'static> TcpServer<M> {
    /// Creates a TCP server using a custom codec.
    pub fn with_codec<H, C>(config: ServerConfig, handler: H, codec: C) -> Result<Self, ServerError>
    where
        H: MessageHandler<M>,
        C: CodecFactory<Message = M>,
    {
        Self::with_transport(config, handler, codec, Arc::new(TcpTransport::new()))
    }

    /// Creates a server on top of any [`Transport`].
    pub fn with_transport<H, C>(
        config: ServerConfig,
        handler: H,
        codec: C,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ServerError>
    where
        H: MessageHandler<M>,
        C: CodecFactory<Message = M>,
    {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            codec: Arc::new(codec),
            transport,
            registry: Arc::new(SessionRegistry::new()),
            lifecycle: Mutex::new(Lifecycle::Stopped),
            state: AtomicU8::new(ServerState::Stopped as u8),
            active: RwLock::new(None),
        })
    }

    /// Binds the listener and starts dispatching.
    ///
    /// Returns the bound address, which is useful when the configured port is
    /// 0. Calling `start` on a running server returns the same address
    /// without binding again.
    ///
    /// # Errors
    ///
    /// * [`ServerError::Bind`] if the address cannot be bound
    /// * [`ServerError::WorkerPool`] if worker threads cannot be spawned
    ///
    /// The server is left stopped in both cases and may be started again.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Running { local_addr, .. } = &*lifecycle {
            debug!("Server '{}' is already running on {}", self.config.name, local_addr);
            return Ok(*local_addr);
        }

        self.set_state(ServerState::Starting);
        info!(
            "🚀 Starting server '{}' on {} with {} workers",
            self.config.name,
            self.config.bind_address(),
            self.config.worker_pool_size
        );

        let dispatcher = match OrderedDispatcher::new(&self.config.name, self.config.worker_pool_size) {
            Ok(dispatcher) => Arc::new(dispatcher),
            Err(e) => {
                error!("❌ Failed to start worker pool for '{}': {}", self.config.name, e);
                self.set_state(ServerState::Stopped);
                return Err(ServerError::WorkerPool(e));
            }
        };
        let codec = Arc::new(CodecPipeline::new(
            Arc::clone(&self.codec),
            self.config.codec_limits(),
        ));
        let outbound = Outbound::new(
            Arc::clone(&self.registry),
            Arc::clone(&codec),
            Arc::clone(&self.transport),
        );
        let events = Arc::new(SessionEvents {
            registry: Arc::clone(&self.registry),
            codec: Arc::clone(&codec),
            dispatcher: Arc::clone(&dispatcher),
            handler: Arc::clone(&self.handler),
            outbound: outbound.clone(),
            idle_action: self.config.idle_action,
        });

        let bound = self
            .transport
            .bind(
                self.config.bind_address(),
                self.config.session_settings(),
                events,
            )
            .await;

        let local_addr = match bound {
            Ok(addr) => addr,
            Err(e) => {
                let err = ServerError::from_transport(e);
                error!("❌ Failed to start server '{}': {}", self.config.name, err);
                shutdown_dispatcher(dispatcher, Duration::ZERO).await;
                self.set_state(ServerState::Stopped);
                return Err(err);
            }
        };

        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(Active {
            local_addr,
            outbound,
        });
        *lifecycle = Lifecycle::Running {
            local_addr,
            dispatcher,
            codec,
        };
        self.set_state(ServerState::Running);
        info!("✅ Server '{}' listening on {}", self.config.name, local_addr);
        Ok(local_addr)
    }

    /// Stops the workers, then unbinds the listener and closes every session.
    ///
    /// Queued handler work gets up to `shutdown_grace_ms` to finish; the rest
    /// is discarded. Frames the handlers wrote are flushed before each
    /// connection closes, and `on_close` hooks run on the closing connection
    /// since the workers are gone by then. Failures along the way are logged,
    /// never returned. Stopping a stopped server does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let (dispatcher, codec) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running {
                dispatcher, codec, ..
            } => (dispatcher, codec),
            Lifecycle::Stopped => {
                debug!("Server '{}' is already stopped", self.config.name);
                return;
            }
        };

        self.set_state(ServerState::Stopping);
        info!("🛑 Stopping server '{}'...", self.config.name);
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Connections stay open while the workers drain.
        shutdown_dispatcher(dispatcher, self.config.shutdown_grace_period()).await;
        if let Err(e) = self.transport.unbind().await {
            warn!("⚠️ Failed to unbind transport for '{}': {}", self.config.name, e);
        }

        let leftover = self.registry.clear();
        if leftover > 0 {
            warn!("⚠️ {} sessions were still registered after unbind", leftover);
        }
        codec.clear();

        self.set_state(ServerState::Stopped);
        info!("✅ Server '{}' stopped", self.config.name);
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.local_addr)
    }

    /// Number of sessions currently open.
    pub fn managed_session_count(&self) -> usize {
        self.registry.count()
    }

    /// Encodes `message` once and queues it on every open session.
    ///
    /// A failure on one session is logged and reported in the returned
    /// [`BroadcastReport`]; the remaining sessions still receive the message.
    pub fn broadcast(&self, message: &M) -> Result<BroadcastReport, ServerError> {
        self.with_outbound(|outbound| outbound.broadcast(message))
    }

    /// Encodes `message` and queues it on one session.
    pub fn send_to(&self, id: SessionId, message: &M) -> Result<(), ServerError> {
        self.with_outbound(|outbound| outbound.send(id, message))
    }

    /// Closes one session after its queued writes are flushed.
    pub fn close_session(&self, id: SessionId) -> Result<(), ServerError> {
        self.with_outbound(|outbound| {
            if self.registry.get(id).is_none() {
                return Err(ServerError::SessionNotFound(id));
            }
            outbound.close(id)
        })
    }

    /// Snapshot of the open sessions.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(|session| session.info())
            .collect()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.registry.get(id).map(|session| session.info())
    }

    /// The server's frozen configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn with_outbound<T>(
        &self,
        f: impl FnOnce(&Outbound<M>) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let active = active.as_ref().ok_or(ServerError::NotRunning)?;
        f(&active.outbound)
    }

    fn set_state(&self, state: ServerState) {
        let previous = ServerState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        debug!("Server '{}' state {} -> {}", self.config.name, previous, state);
    }
}

/// Drains the dispatcher on a blocking thread.
async fn shutdown_dispatcher(dispatcher: Arc<OrderedDispatcher>, grace: Duration) {
    match tokio::task::spawn_blocking(move || dispatcher.shutdown(grace)).await {
        Ok(report) => debug!(
            "Dispatcher drained: {} executed, {} failed, {} discarded",
            report.executed, report.failed, report.discarded
        ),
        Err(e) => error!("❌ Dispatcher shutdown task failed: {}", e),
    }
}

impl<M> std::fmt::Debug for TcpServer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.config.name)
            .field("state", &ServerState::from_u8(self.state.load(Ordering::Acquire)))
            .field("sessions", &self.registry.count())
            .finish()
    }
}
