//! # TCP Server - Ordered Connection Orchestration
//!
//! The orchestration core of a TCP server: it accepts connections, applies
//! per-connection socket settings, turns each connection's byte stream into
//! application messages through a pluggable codec, and hands those messages
//! to an application handler while preserving per-connection ordering.
//!
//! ## Design Philosophy
//!
//! The server core contains **no application protocol**. It only provides:
//!
//! * **Lifecycle management** - idempotent `start`/`stop` guarded by one lock per server
//! * **Ordered dispatch** - one session's messages are handled one at a time, in order
//! * **Pluggable codecs** - length-delimited frames by default, JSON or your own codec
//! * **Idle detection** - reader/writer idle notifications with an optional close policy
//! * **Broadcast** - encode once, deliver to every open session
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Transport** ([`Transport`]) - the I/O engine; [`TcpTransport`] is the tokio implementation
//! * **Codec Pipeline** ([`CodecPipeline`]) - per-session decoders, shared encoder, write limits
//! * **Session Registry** ([`SessionRegistry`]) - live sessions, ids, broadcast
//! * **Ordered Dispatcher** ([`OrderedDispatcher`]) - fixed worker pool keyed by session id
//! * **Server** ([`TcpServer`]) - wires everything together and owns the lifecycle
//!
//! ### Message Flow
//!
//! 1. The transport delivers raw bytes for a session
//! 2. The codec pipeline decodes zero or more messages
//! 3. Each message is queued on the session's dispatcher worker
//! 4. The worker invokes the [`MessageHandler`]
//! 5. Handler writes are encoded and queued back on the transport
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use tcp_server::{ServerConfig, SessionContext, TcpServer};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = TcpServer::new(
//!     ServerConfig::builder().port(7000).worker_pool_size(4).build()?,
//!     |ctx: &SessionContext<Bytes>, msg: Bytes| -> anyhow::Result<()> {
//!         // Echo every frame back to its sender
//!         ctx.write(&msg)?;
//!         Ok(())
//!     },
//! )?;
//!
//! server.start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`ServerConfig`] covers the bind address, socket options (reuse address,
//! buffer sizes, no-delay, linger, backlog), idle thresholds, worker pool size
//! and codec limits. The server keeps its own frozen copy.
//!
//! ## Error Handling
//!
//! Start-time failures are returned from [`TcpServer::start`] as
//! [`ServerError`]. Failures inside one session (codec errors, I/O errors,
//! handler errors or panics) are logged and only ever affect that session.
//! `stop` is best-effort and never fails.
//!
//! ## Logging
//!
//! The crate logs through `tracing` and never installs a subscriber.

pub use codec::{CodecError, CodecFactory, CodecLimits, CodecPipeline, DecodeFailure, Decoder, Encoder, JsonCodec, LengthDelimited};
pub use config::{IdleAction, ServerConfig, ServerConfigBuilder};
pub use dispatcher::{DispatchError, OrderedDispatcher, ShutdownReport};
pub use error::{ConfigError, ServerError};
pub use messaging::{MessageHandler, SessionContext};
pub use server::{ServerState, TcpServer};
pub use session::{BroadcastReport, Session, SessionId, SessionInfo, SessionRegistry};
pub use transport::{Flow, IdleStatus, SessionSettings, TcpTransport, Transport, TransportError, TransportEvents};
pub use utils::{create_server, create_server_with_config};

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod messaging;
pub mod server;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
