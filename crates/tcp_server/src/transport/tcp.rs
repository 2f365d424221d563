//! Tokio-based TCP engine.

use super::connection::{self, Connection, Outgoing};
use super::{SessionSettings, Transport, TransportError, TransportEvents};
use crate::session::SessionId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Outbound queues of every live connection.
pub(super) type Outboxes = Arc<DashMap<SessionId, mpsc::UnboundedSender<Outgoing>>>;

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct Acceptor {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// [`Transport`] over tokio sockets.
///
/// One task accepts connections and one task per connection multiplexes
/// reads, queued outbound frames and idle timers. Socket options the
/// listener cannot carry (linger, per-connection buffers) are applied with
/// `socket2` on each accepted stream.
#[derive(Default)]
pub struct TcpTransport {
    connections: Outboxes,
    acceptor: Mutex<Option<Acceptor>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the listener is bound to, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().await.as_ref().map(|a| a.local_addr)
    }

    fn send(&self, id: SessionId, item: Outgoing) -> Result<(), TransportError> {
        let outbox = self
            .connections
            .get(&id)
            .ok_or(TransportError::SessionClosed(id))?;
        outbox.send(item).map_err(|_| TransportError::SessionClosed(id))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(
        &self,
        addr: SocketAddr,
        settings: SessionSettings,
        events: Arc<dyn TransportEvents>,
    ) -> Result<SocketAddr, TransportError> {
        let mut acceptor = self.acceptor.lock().await;
        if let Some(existing) = acceptor.as_ref() {
            return Err(TransportError::AlreadyBound(existing.local_addr));
        }

        let listener =
            open_listener(addr, &settings).map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(settings),
            events,
            Arc::clone(&self.connections),
            shutdown_rx,
        ));

        info!("🌐 Listening on {}", local_addr);
        *acceptor = Some(Acceptor {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    async fn unbind(&self) -> Result<(), TransportError> {
        let acceptor = self
            .acceptor
            .lock()
            .await
            .take()
            .ok_or(TransportError::NotBound)?;

        let _ = acceptor.shutdown.send(true);
        if let Err(e) = acceptor.task.await {
            error!("❌ Accept loop for {} ended abnormally: {}", acceptor.local_addr, e);
        }
        info!("🔌 Listener on {} closed", acceptor.local_addr);
        Ok(())
    }

    fn write(&self, id: SessionId, frame: Bytes) -> Result<(), TransportError> {
        self.send(id, Outgoing::Frame(frame))
    }

    fn close(&self, id: SessionId) -> Result<(), TransportError> {
        self.send(id, Outgoing::Close)
    }

    fn managed_session_count(&self) -> usize {
        self.connections.len()
    }
}

fn open_listener(addr: SocketAddr, settings: &SessionSettings) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(settings.reuse_address)?;
    // Accepted sockets inherit these, which matters for the TCP window.
    if settings.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(clamp_u32(settings.receive_buffer_size))?;
    }
    if settings.send_buffer_size > 0 {
        socket.set_send_buffer_size(clamp_u32(settings.send_buffer_size))?;
    }
    socket.bind(addr)?;
    socket.listen(settings.backlog)
}

fn apply_socket_options(stream: &TcpStream, settings: &SessionSettings) -> std::io::Result<()> {
    stream.set_nodelay(settings.tcp_no_delay)?;
    let socket = SockRef::from(stream);
    if settings.so_linger.is_some() {
        socket.set_linger(settings.so_linger)?;
    }
    if settings.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(settings.receive_buffer_size)?;
    }
    if settings.send_buffer_size > 0 {
        socket.set_send_buffer_size(settings.send_buffer_size)?;
    }
    Ok(())
}

fn clamp_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

async fn accept_loop(
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    events: Arc<dyn TransportEvents>,
    connections: Outboxes,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = connection::stopped(&mut shutdown) => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("❌ Connection task failed: {}", e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    if let Err(e) = apply_socket_options(&stream, &settings) {
                        warn!("⚠️ Failed to apply socket options for {}: {}", remote_addr, e);
                    }

                    let id = events.on_accept(remote_addr);
                    let (outbox, outgoing) = mpsc::unbounded_channel();
                    connections.insert(id, outbox);
                    events.on_open(id);
                    debug!(session_id = %id, "Accepted connection from {}", remote_addr);

                    tasks.spawn(connection::run(Connection {
                        id,
                        stream,
                        outgoing,
                        events: Arc::clone(&events),
                        reader_idle: settings.reader_idle_time,
                        writer_idle: settings.writer_idle_time,
                        shutdown: shutdown.clone(),
                        connections: Arc::clone(&connections),
                    }));
                }
                Err(e) => {
                    warn!("⚠️ Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    let open = tasks.len();
    if open > 0 {
        debug!("Waiting for {} connections to close", open);
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("❌ Connection task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Flow, IdleStatus};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Records every callback and echoes data back through the transport.
    #[derive(Default)]
    struct EventLog {
        log: StdMutex<Vec<String>>,
    }

    impl EventLog {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl TransportEvents for EventLog {
        fn on_accept(&self, _remote_addr: SocketAddr) -> SessionId {
            let id = SessionId::next();
            self.push(format!("accept {id}"));
            id
        }

        fn on_open(&self, id: SessionId) {
            self.push(format!("open {id}"));
        }

        fn on_data(&self, id: SessionId, data: &[u8]) -> Flow {
            self.push(format!("data {id} {}", String::from_utf8_lossy(data)));
            if data == b"bye" {
                Flow::Close
            } else {
                Flow::Continue
            }
        }

        fn on_idle(&self, id: SessionId, status: IdleStatus) -> Flow {
            self.push(format!("idle {id} {status:?}"));
            Flow::Continue
        }

        fn on_written(&self, id: SessionId) {
            self.push(format!("written {id}"));
        }

        fn on_close(&self, id: SessionId) {
            self.push(format!("close {id}"));
        }

        fn on_error(&self, id: SessionId, error: &std::io::Error) {
            self.push(format!("error {id} {error}"));
        }
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_ephemeral_port_and_double_bind() {
        let transport = TcpTransport::new();
        let log = Arc::new(EventLog::default());

        let addr = transport
            .bind(localhost(), SessionSettings::default(), log.clone())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.local_addr().await, Some(addr));

        let err = transport
            .bind(localhost(), SessionSettings::default(), log.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AlreadyBound(a) if a == addr));

        transport.unbind().await.unwrap();
        assert!(matches!(transport.unbind().await, Err(TransportError::NotBound)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_port_in_use() {
        let first = TcpTransport::new();
        let log = Arc::new(EventLog::default());
        let addr = first
            .bind(localhost(), SessionSettings::default(), log.clone())
            .await
            .unwrap();

        let second = TcpTransport::new();
        let err = second
            .bind(addr, SessionSettings::default(), log.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));

        first.unbind().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_close_and_callbacks() {
        let transport = Arc::new(TcpTransport::new());
        let log = Arc::new(EventLog::default());
        let settings = SessionSettings {
            so_linger: Some(Duration::from_secs(1)),
            receive_buffer_size: 16 * 1024,
            send_buffer_size: 16 * 1024,
            ..SessionSettings::default()
        };
        let addr = transport.bind(localhost(), settings, log.clone()).await.unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        // Wait for the accept and the data to be observed.
        let id = loop {
            let entries = log.entries();
            if entries.iter().any(|e| e.starts_with("data")) {
                let accept = entries.iter().find(|e| e.starts_with("accept")).unwrap();
                break SessionId(accept.trim_start_matches("accept ").parse().unwrap());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(transport.managed_session_count(), 1);

        transport.write(id, Bytes::from_static(b"world")).unwrap();
        transport.close(id).unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"world");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let entries = log.entries();
        assert_eq!(
            entries,
            vec![
                format!("accept {id}"),
                format!("open {id}"),
                format!("data {id} hello"),
                format!("written {id}"),
                format!("close {id}"),
            ]
        );
        assert_eq!(transport.managed_session_count(), 0);
        assert!(matches!(
            transport.write(id, Bytes::new()),
            Err(TransportError::SessionClosed(_))
        ));

        transport.unbind().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unbind_closes_connections() {
        let transport = TcpTransport::new();
        let log = Arc::new(EventLog::default());
        let addr = transport
            .bind(localhost(), SessionSettings::default(), log.clone())
            .await
            .unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        while transport.managed_session_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        transport.unbind().await.unwrap();
        assert_eq!(transport.managed_session_count(), 0);
        assert!(log.entries().iter().any(|e| e.starts_with("close")));

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reader_idle_fires_repeatedly() {
        let transport = TcpTransport::new();
        let log = Arc::new(EventLog::default());
        let settings = SessionSettings {
            reader_idle_time: Duration::from_millis(50),
            ..SessionSettings::default()
        };
        let addr = transport.bind(localhost(), settings, log.clone()).await.unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let idles = log
            .entries()
            .iter()
            .filter(|e| e.starts_with("idle") && e.ends_with("Reader"))
            .count();
        assert!(idles >= 2, "expected repeated idle notifications, got {idles}");
        transport.unbind().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unbind_flushes_queued_frames() {
        let transport = TcpTransport::new();
        let log = Arc::new(EventLog::default());
        let addr = transport
            .bind(localhost(), SessionSettings::default(), log.clone())
            .await
            .unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        while transport.managed_session_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let id = log
            .entries()
            .iter()
            .find_map(|e| e.strip_prefix("accept ").map(|n| SessionId(n.parse().unwrap())))
            .unwrap();

        for i in 0..100u8 {
            transport.write(id, Bytes::from(vec![i; 64])).unwrap();
        }
        transport.unbind().await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 100 * 64);
        assert!(received.chunks(64).enumerate().all(|(i, c)| c.iter().all(|b| *b == i as u8)));

        let entries = log.entries();
        assert_eq!(entries.iter().filter(|e| e.starts_with("written")).count(), 100);
        assert_eq!(entries.last(), Some(&format!("close {id}")));
    }
}
