//! Server configuration types and defaults.
//!
//! This module contains the [`ServerConfig`] structure that describes socket
//! tuning and server behavior, the builder used to assemble a validated
//! configuration, and the conversions into the settings consumed by the
//! transport and the codec pipeline.
//!
//! A server takes its own frozen copy of the configuration at construction.
//! Changing the value the caller still holds has no effect on a running server.

use crate::codec::CodecLimits;
use crate::error::ConfigError;
use crate::transport::SessionSettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Largest socket buffer size accepted by the OS (`c_int`).
const MAX_SOCKET_BUFFER: usize = i32::MAX as usize;

/// Largest linger timeout accepted, in seconds.
const MAX_LINGER_SECS: u64 = u16::MAX as u64;

/// What happens to a session once one of its idle timers fires.
///
/// The handler's `on_idle` hook is invoked in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleAction {
    /// Only notify the handler; the session stays open.
    #[default]
    Notify,
    /// Notify the handler, then close the session.
    Close,
}

/// Configuration structure for the TCP server.
///
/// Contains the network binding, socket-level session defaults, idle
/// detection thresholds and the limits applied by the dispatcher and the
/// codec pipeline. Durations are stored as integer milliseconds (linger in
/// seconds, as the socket option is) so the structure reads naturally from
/// TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Human readable server name, used in logs and worker thread names
    pub name: String,

    /// Local address to listen on
    pub bind_ip: IpAddr,

    /// TCP port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Listen backlog handed to the OS
    pub backlog: u32,

    /// Whether `SO_REUSEADDR` is set on the listener
    pub reuse_address: bool,

    /// `SO_RCVBUF` for accepted sockets in bytes (0 keeps the OS default)
    pub receive_buffer_size: usize,

    /// `SO_SNDBUF` for accepted sockets in bytes (0 keeps the OS default)
    pub send_buffer_size: usize,

    /// Whether `TCP_NODELAY` is set on accepted sockets
    pub tcp_no_delay: bool,

    /// `SO_LINGER` timeout in seconds (`None` disables lingering)
    pub so_linger_secs: Option<u64>,

    /// Read inactivity before the reader idle hook fires (0 disables)
    pub reader_idle_ms: u64,

    /// Write inactivity before the writer idle hook fires (0 disables)
    pub writer_idle_ms: u64,

    /// Policy applied when an idle timer fires
    pub idle_action: IdleAction,

    /// Number of ordered dispatcher worker threads
    pub worker_pool_size: usize,

    /// Maximum number of undecoded bytes buffered per session
    pub max_read_frame_size: usize,

    /// Maximum encoded-but-unflushed frames per session (0 = unlimited)
    pub max_scheduled_writes: usize,

    /// How long `stop` lets the dispatcher drain queued work
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tcp-server".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            backlog: 1024,
            reuse_address: true,
            receive_buffer_size: 0,
            send_buffer_size: 0,
            tcp_no_delay: true,
            so_linger_secs: None,
            reader_idle_ms: 0,
            writer_idle_ms: 0,
            idle_action: IdleAction::Notify,
            worker_pool_size: num_cpus::get(),
            max_read_frame_size: 64 * 1024, // 64KB
            max_scheduled_writes: 1024,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Starts a builder seeded with the default configuration.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if every value is usable, or the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_read_frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        if self.backlog == 0 || self.backlog > i32::MAX as u32 {
            return Err(ConfigError::InvalidBacklog(self.backlog));
        }
        for (option, value) in [
            ("receive_buffer_size", self.receive_buffer_size),
            ("send_buffer_size", self.send_buffer_size),
        ] {
            if value > MAX_SOCKET_BUFFER {
                return Err(ConfigError::BufferTooLarge { option, value });
            }
        }
        if let Some(secs) = self.so_linger_secs {
            if secs > MAX_LINGER_SECS {
                return Err(ConfigError::LingerOutOfRange(secs));
            }
        }
        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Reader idle threshold (`Duration::ZERO` when disabled).
    pub fn reader_idle_time(&self) -> Duration {
        Duration::from_millis(self.reader_idle_ms)
    }

    /// Writer idle threshold (`Duration::ZERO` when disabled).
    pub fn writer_idle_time(&self) -> Duration {
        Duration::from_millis(self.writer_idle_ms)
    }

    /// Linger timeout, if lingering is enabled.
    pub fn so_linger(&self) -> Option<Duration> {
        self.so_linger_secs.map(Duration::from_secs)
    }

    /// Grace period granted to queued work during shutdown.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Per-session socket defaults handed to the transport at bind time.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            reuse_address: self.reuse_address,
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            tcp_no_delay: self.tcp_no_delay,
            so_linger: self.so_linger(),
            reader_idle_time: self.reader_idle_time(),
            writer_idle_time: self.writer_idle_time(),
            backlog: self.backlog,
        }
    }

    /// Limits applied by the codec pipeline.
    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_read_frame_size: self.max_read_frame_size,
            max_scheduled_writes: self.max_scheduled_writes,
        }
    }
}

/// Builder producing a validated [`ServerConfig`].
///
/// ```rust
/// use tcp_server::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .name("lobby")
///     .port(9000)
///     .worker_pool_size(4)
///     .reader_idle_ms(30_000)
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.port, 9000);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
    port: u32,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        let config = ServerConfig::default();
        let port = u32::from(config.port);
        Self { config, port }
    }
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    /// Port to listen on. Values above 65535 are rejected by [`build`](Self::build).
    pub fn port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.config.reuse_address = reuse;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.config.receive_buffer_size = size;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.config.send_buffer_size = size;
        self
    }

    pub fn tcp_no_delay(mut self, no_delay: bool) -> Self {
        self.config.tcp_no_delay = no_delay;
        self
    }

    pub fn so_linger_secs(mut self, secs: Option<u64>) -> Self {
        self.config.so_linger_secs = secs;
        self
    }

    pub fn reader_idle_ms(mut self, ms: u64) -> Self {
        self.config.reader_idle_ms = ms;
        self
    }

    pub fn writer_idle_ms(mut self, ms: u64) -> Self {
        self.config.writer_idle_ms = ms;
        self
    }

    pub fn idle_action(mut self, action: IdleAction) -> Self {
        self.config.idle_action = action;
        self
    }

    pub fn worker_pool_size(mut self, workers: usize) -> Self {
        self.config.worker_pool_size = workers;
        self
    }

    pub fn max_read_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_read_frame_size = bytes;
        self
    }

    pub fn max_scheduled_writes(mut self, writes: usize) -> Self {
        self.config.max_scheduled_writes = writes;
        self
    }

    pub fn shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_grace_ms = ms;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let port = u16::try_from(self.port).map_err(|_| ConfigError::InvalidPort(self.port))?;
        let config = ServerConfig { port, ..self.config };
        config.validate()?;
        Ok(config)
    }
}
