//! The I/O engine contract and the tokio implementation.
//!
//! A [`Transport`] owns the listening socket and every accepted connection.
//! It reports what happens on those connections through [`TransportEvents`],
//! whose callbacks are synchronous and must not block for long: decoding
//! happens inline, handler work is always handed to the dispatcher.

mod connection;
mod tcp;

pub use tcp::TcpTransport;

use crate::session::SessionId;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Which side of a session has been idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    /// No data read for `reader_idle_time`.
    Reader,
    /// Nothing written for `writer_idle_time`.
    Writer,
}

/// Returned from event callbacks to keep or close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Socket options and idle thresholds applied by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub reuse_address: bool,
    /// 0 keeps the OS default
    pub receive_buffer_size: usize,
    /// 0 keeps the OS default
    pub send_buffer_size: usize,
    pub tcp_no_delay: bool,
    pub so_linger: Option<Duration>,
    /// `Duration::ZERO` disables reader idle detection
    pub reader_idle_time: Duration,
    /// `Duration::ZERO` disables writer idle detection
    pub writer_idle_time: Duration,
    pub backlog: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reuse_address: true,
            receive_buffer_size: 0,
            send_buffer_size: 0,
            tcp_no_delay: true,
            so_linger: None,
            reader_idle_time: Duration::ZERO,
            writer_idle_time: Duration::ZERO,
            backlog: 1024,
        }
    }
}

/// Callbacks from the transport into the server.
pub trait TransportEvents: Send + Sync + 'static {
    /// A connection was accepted; returns the id the transport must use for it.
    fn on_accept(&self, remote_addr: SocketAddr) -> SessionId;

    /// The connection is tracked and writable.
    fn on_open(&self, id: SessionId);

    /// Raw bytes arrived.
    fn on_data(&self, id: SessionId, data: &[u8]) -> Flow;

    /// An idle timer fired.
    fn on_idle(&self, id: SessionId, status: IdleStatus) -> Flow;

    /// One outbound frame was flushed to the socket or dropped on close.
    fn on_written(&self, id: SessionId);

    /// The connection is gone. Called exactly once per accepted connection.
    fn on_close(&self, id: SessionId);

    /// An I/O error occurred; `on_close` follows.
    fn on_error(&self, id: SessionId, error: &std::io::Error);
}

/// Transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport is already bound to {0}")]
    AlreadyBound(SocketAddr),

    #[error("Transport is not bound")]
    NotBound,

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The asynchronous I/O engine consumed by the server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts listening on `addr` and returns the bound address.
    async fn bind(
        &self,
        addr: SocketAddr,
        settings: SessionSettings,
        events: Arc<dyn TransportEvents>,
    ) -> Result<SocketAddr, TransportError>;

    /// Closes the listener and every connection, waiting until each
    /// connection's `on_close` has been delivered.
    async fn unbind(&self) -> Result<(), TransportError>;

    /// Queues an encoded frame for the session. Never blocks.
    fn write(&self, id: SessionId, frame: Bytes) -> Result<(), TransportError>;

    /// Closes the session after frames already queued for it are flushed.
    fn close(&self, id: SessionId) -> Result<(), TransportError>;

    /// Number of connections currently held by the engine.
    fn managed_session_count(&self) -> usize;
}
