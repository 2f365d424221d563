//! Error types and handling for the TCP server.
//!
//! Start-time failures are surfaced to the caller through [`ServerError`];
//! per-session failures are logged and isolated to the session they belong to.

use crate::codec::CodecError;
use crate::session::SessionId;
use crate::transport::TransportError;
use std::net::SocketAddr;

/// Invalid configuration values, reported by the builder and by every server
/// constructor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Server name must not be empty")]
    EmptyName,

    #[error("Port {0} is outside the valid range 0-65535")]
    InvalidPort(u32),

    #[error("Listen backlog {0} is invalid")]
    InvalidBacklog(u32),

    #[error("Worker pool size must be at least 1")]
    ZeroWorkers,

    #[error("Maximum read frame size must be at least 1 byte")]
    ZeroFrameSize,

    #[error("{option} of {value} bytes exceeds the socket limit")]
    BufferTooLarge { option: &'static str, value: usize },

    #[error("Linger timeout of {0}s exceeds the socket limit")]
    LingerOutOfRange(u64),
}

/// Enumeration of possible server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration handed to the server was rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A message could not be decoded or encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The session already has the maximum number of unflushed writes
    #[error("Session {session_id} has {limit} writes pending")]
    WriteBackpressure { session_id: SessionId, limit: usize },

    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// The transport refused an operation
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Dispatcher worker threads could not be spawned
    #[error("Failed to start worker pool: {0}")]
    WorkerPool(#[source] std::io::Error),

    #[error("Server is not running")]
    NotRunning,
}

impl ServerError {
    /// Converts a transport error, lifting bind failures into [`ServerError::Bind`].
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Bind { addr, source } => ServerError::Bind { addr, source },
            TransportError::SessionClosed(id) => ServerError::SessionNotFound(id),
            other => ServerError::Transport(other),
        }
    }
}
