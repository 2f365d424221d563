//! Per-connection task: reads, queued writes and idle timers on one socket.

use super::tcp::Outboxes;
use super::{Flow, IdleStatus, TransportEvents};
use crate::session::SessionId;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long a connection keeps writing queued frames once shutdown starts.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands queued for a connection's writer.
#[derive(Debug)]
pub(super) enum Outgoing {
    Frame(Bytes),
    /// Close once everything queued before it is written.
    Close,
}

pub(super) struct Connection {
    pub id: SessionId,
    pub stream: TcpStream,
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
    pub events: Arc<dyn TransportEvents>,
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub shutdown: watch::Receiver<bool>,
    pub connections: Outboxes,
}

/// Idle deadlines; each one re-arms a full period after firing.
struct IdleTracker {
    reader_idle: Duration,
    writer_idle: Duration,
    reader_deadline: Option<Instant>,
    writer_deadline: Option<Instant>,
}

impl IdleTracker {
    fn new(reader_idle: Duration, writer_idle: Duration) -> Self {
        let now = Instant::now();
        Self {
            reader_idle,
            writer_idle,
            reader_deadline: (!reader_idle.is_zero()).then(|| now + reader_idle),
            writer_deadline: (!writer_idle.is_zero()).then(|| now + writer_idle),
        }
    }

    fn touch_read(&mut self) {
        if self.reader_deadline.is_some() {
            self.reader_deadline = Some(Instant::now() + self.reader_idle);
        }
    }

    fn touch_write(&mut self) {
        if self.writer_deadline.is_some() {
            self.writer_deadline = Some(Instant::now() + self.writer_idle);
        }
    }

    /// Waits for the earliest deadline. Never resolves when both are disabled.
    async fn next(&mut self) -> IdleStatus {
        let (deadline, status) = match (self.reader_deadline, self.writer_deadline) {
            (Some(r), Some(w)) if w < r => (w, IdleStatus::Writer),
            (Some(r), _) => (r, IdleStatus::Reader),
            (None, Some(w)) => (w, IdleStatus::Writer),
            (None, None) => std::future::pending().await,
        };
        sleep_until(deadline).await;

        match status {
            IdleStatus::Reader => self.reader_deadline = Some(Instant::now() + self.reader_idle),
            IdleStatus::Writer => self.writer_deadline = Some(Instant::now() + self.writer_idle),
        }
        status
    }
}

/// Resolves once the transport is shutting down.
///
/// Also resolves if the sender is gone, which only happens after unbind.
pub(super) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Writes one frame. Shutdown does not cut a frame in half: once it is
/// signalled the write gets [`SHUTDOWN_FLUSH_TIMEOUT`] to finish.
///
/// Returns `None` if that time ran out.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    shutdown: &mut watch::Receiver<bool>,
) -> Option<std::io::Result<()>> {
    let write = writer.write_all(frame);
    tokio::pin!(write);
    tokio::select! {
        biased;
        result = &mut write => return Some(result),
        _ = stopped(shutdown) => {}
    }
    timeout(SHUTDOWN_FLUSH_TIMEOUT, write).await.ok()
}

/// Writes what is still queued when the transport shuts down, up to the
/// first `Close` command.
async fn flush_on_shutdown(
    id: SessionId,
    writer: &mut OwnedWriteHalf,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    events: &dyn TransportEvents,
) {
    let deadline = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
    let mut flushed = 0usize;
    while let Ok(Outgoing::Frame(frame)) = outgoing.try_recv() {
        let written = timeout_at(deadline, writer.write_all(&frame)).await;
        events.on_written(id);
        match written {
            Ok(Ok(())) => flushed += 1,
            Ok(Err(e)) => {
                events.on_error(id, &e);
                break;
            }
            Err(_) => {
                debug!(session_id = %id, "Gave up flushing after {:?}", SHUTDOWN_FLUSH_TIMEOUT);
                break;
            }
        }
    }
    if flushed > 0 {
        trace!(session_id = %id, "Flushed {} frames on shutdown", flushed);
    }
}

pub(super) async fn run(connection: Connection) {
    let Connection {
        id,
        stream,
        mut outgoing,
        events,
        reader_idle,
        writer_idle,
        mut shutdown,
        connections,
    } = connection;

    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut idle = IdleTracker::new(reader_idle, writer_idle);
    let mut flush_queued = false;

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => {
                debug!(session_id = %id, "Closing connection for shutdown");
                flush_queued = true;
                break;
            }
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    debug!(session_id = %id, "Peer closed connection");
                    break;
                }
                Ok(n) => {
                    trace!(session_id = %id, "Read {} bytes", n);
                    idle.touch_read();
                    let flow = events.on_data(id, &buffer);
                    buffer.clear();
                    if flow == Flow::Close {
                        break;
                    }
                }
                Err(e) => {
                    events.on_error(id, &e);
                    break;
                }
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(frame)) => {
                    let written = write_frame(&mut writer, &frame, &mut shutdown).await;
                    events.on_written(id);
                    match written {
                        Some(Ok(())) => idle.touch_write(),
                        Some(Err(e)) => {
                            events.on_error(id, &e);
                            break;
                        }
                        None => {
                            debug!(session_id = %id, "Write did not finish before shutdown");
                            break;
                        }
                    }
                }
                Some(Outgoing::Close) | None => {
                    debug!(session_id = %id, "Closing connection on request");
                    break;
                }
            },
            status = idle.next() => {
                if events.on_idle(id, status) == Flow::Close {
                    debug!(session_id = %id, "Closing idle connection");
                    break;
                }
            }
        }
    }

    connections.remove(&id);
    outgoing.close();
    if flush_queued {
        flush_on_shutdown(id, &mut writer, &mut outgoing, events.as_ref()).await;
    }
    // Frames that will never be written still hold a scheduled-write slot.
    while let Ok(command) = outgoing.try_recv() {
        if let Outgoing::Frame(_) = command {
            events.on_written(id);
        }
    }
    let _ = writer.shutdown().await;
    events.on_close(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_tracker_picks_earliest_and_rearms() {
        let mut idle = IdleTracker::new(Duration::from_millis(300), Duration::from_millis(200));

        assert_eq!(idle.next().await, IdleStatus::Writer);
        idle.touch_read();
        // Writer re-armed to ~400ms, reader pushed to ~500ms.
        assert_eq!(idle.next().await, IdleStatus::Writer);
        assert_eq!(idle.next().await, IdleStatus::Reader);
    }

    #[tokio::test]
    async fn test_disabled_idle_never_fires() {
        let mut idle = IdleTracker::new(Duration::ZERO, Duration::ZERO);
        let fired = tokio::time::timeout(Duration::from_millis(200), idle.next()).await;
        assert!(fired.is_err());
    }
}
