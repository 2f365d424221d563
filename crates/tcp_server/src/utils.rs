//! Utility functions for creating server instances.

use crate::{config::ServerConfig, error::ServerError, messaging::MessageHandler, server::TcpServer};
use bytes::Bytes;

/// Creates a length-delimited server on `port` with default settings.
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use tcp_server::{create_server, SessionContext};
///
/// let server = create_server(9000, |ctx: &SessionContext<Bytes>, msg: Bytes| -> anyhow::Result<()> {
///     ctx.write(&msg)?;
///     Ok(())
/// })
/// .expect("default configuration is valid");
/// assert_eq!(server.config().port, 9000);
/// ```
pub fn create_server<H>(port: u16, handler: H) -> Result<TcpServer, ServerError>
where
    H: MessageHandler<Bytes>,
{
    let config = ServerConfig {
        port,
        ..ServerConfig::default()
    };
    TcpServer::new(config, handler)
}

/// Creates a length-delimited server with a custom configuration.
///
/// # Errors
///
/// Returns [`ServerError::Config`] if `config` does not validate.
pub fn create_server_with_config<H>(config: ServerConfig, handler: H) -> Result<TcpServer, ServerError>
where
    H: MessageHandler<Bytes>,
{
    TcpServer::new(config, handler)
}
