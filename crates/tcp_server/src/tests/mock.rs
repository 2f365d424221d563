//! In-memory transport and a recording handler for server tests.

use crate::codec::LengthDelimitedEncoder;
use crate::{
    Encoder, Flow, IdleStatus, MessageHandler, ServerConfig, ServerError, SessionContext, SessionId,
    SessionSettings, Transport, TransportError, TransportEvents,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ServerConfig {
    ServerConfig::builder()
        .name("test")
        .bind_ip([127, 0, 0, 1].into())
        .port(0)
        .worker_pool_size(2)
        .shutdown_grace_ms(2_000)
        .build()
        .expect("test config is valid")
}

/// Length-delimited wire bytes for `payload`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    LengthDelimitedEncoder
        .encode(&Bytes::copy_from_slice(payload), &mut buf)
        .unwrap();
    buf.to_vec()
}

pub fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

/// Transport driven by the test instead of sockets.
///
/// Writes are recorded per session and, unless flushes are held, reported
/// as written immediately.
#[derive(Default)]
pub struct MockTransport {
    events: Mutex<Option<Arc<dyn TransportEvents>>>,
    open: Mutex<HashSet<SessionId>>,
    written: Mutex<HashMap<SessionId, Vec<Bytes>>>,
    held: Mutex<HashMap<SessionId, usize>>,
    failing: Mutex<HashSet<SessionId>>,
    hold_flushes: AtomicBool,
    fail_bind: AtomicBool,
    pub bind_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Arc<dyn TransportEvents> {
        self.events
            .lock()
            .unwrap()
            .clone()
            .expect("transport is not bound")
    }

    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub fn set_hold_flushes(&self, hold: bool) {
        self.hold_flushes.store(hold, Ordering::SeqCst);
    }

    pub fn fail_writes_for(&self, id: SessionId) {
        self.failing.lock().unwrap().insert(id);
    }

    pub fn connect(&self, remote_addr: SocketAddr) -> SessionId {
        let events = self.events();
        let id = events.on_accept(remote_addr);
        self.open.lock().unwrap().insert(id);
        events.on_open(id);
        id
    }

    pub fn deliver(&self, id: SessionId, data: &[u8]) -> Flow {
        let flow = self.events().on_data(id, data);
        if flow == Flow::Close {
            self.disconnect(id);
        }
        flow
    }

    pub fn idle(&self, id: SessionId, status: IdleStatus) -> Flow {
        let flow = self.events().on_idle(id, status);
        if flow == Flow::Close {
            self.disconnect(id);
        }
        flow
    }

    pub fn fail_io(&self, id: SessionId, error: std::io::Error) {
        let events = self.events();
        events.on_error(id, &error);
        self.disconnect(id);
    }

    pub fn disconnect(&self, id: SessionId) {
        let removed = self.open.lock().unwrap().remove(&id);
        if removed {
            self.events().on_close(id);
        }
    }

    /// Reports every held frame of `id` as flushed.
    pub fn flush(&self, id: SessionId) {
        let held = self.held.lock().unwrap().remove(&id).unwrap_or(0);
        let events = self.events();
        for _ in 0..held {
            events.on_written(id);
        }
    }

    pub fn writes_for(&self, id: SessionId) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_open(&self, id: SessionId) -> bool {
        self.open.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn bind(
        &self,
        addr: SocketAddr,
        _settings: SessionSettings,
        events: Arc<dyn TransportEvents>,
    ) -> Result<SocketAddr, TransportError> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(TransportError::Bind {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }

        let mut slot = self.events.lock().unwrap();
        if slot.is_some() {
            return Err(TransportError::AlreadyBound(addr));
        }
        *slot = Some(events);
        Ok(SocketAddr::new(addr.ip(), 40_000))
    }

    async fn unbind(&self) -> Result<(), TransportError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::NotBound)?;
        let open: Vec<SessionId> = self.open.lock().unwrap().drain().collect();
        for id in open {
            events.on_close(id);
        }
        Ok(())
    }

    fn write(&self, id: SessionId, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open(id) || self.failing.lock().unwrap().contains(&id) {
            return Err(TransportError::SessionClosed(id));
        }
        self.written.lock().unwrap().entry(id).or_default().push(frame);

        if self.hold_flushes.load(Ordering::SeqCst) {
            *self.held.lock().unwrap().entry(id).or_default() += 1;
        } else {
            self.events().on_written(id);
        }
        Ok(())
    }

    fn close(&self, id: SessionId) -> Result<(), TransportError> {
        if !self.is_open(id) {
            return Err(TransportError::SessionClosed(id));
        }
        self.disconnect(id);
        Ok(())
    }

    fn managed_session_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}

/// Everything a handler was told, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open(SessionId),
    Message(SessionId, Bytes),
    Idle(SessionId, IdleStatus),
    Close(SessionId),
    Error(SessionId, String),
}

/// Handler that records callbacks.
///
/// A message `fail` makes `on_message` return an error and `panic` makes it
/// panic, both after recording. With `echo` set every other message is
/// written back to its sender.
pub struct Recorder {
    events: Sender<Event>,
    echo: bool,
}

pub fn recorder(echo: bool) -> (Recorder, Receiver<Event>) {
    let (tx, rx) = channel::unbounded();
    (Recorder { events: tx, echo }, rx)
}

impl MessageHandler<Bytes> for Recorder {
    fn on_message(&self, ctx: &SessionContext<Bytes>, message: Bytes) -> anyhow::Result<()> {
        let _ = self.events.send(Event::Message(ctx.id(), message.clone()));
        match &message[..] {
            b"fail" => anyhow::bail!("requested failure"),
            b"panic" => panic!("requested panic"),
            _ if self.echo => {
                ctx.write(&message)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_open(&self, ctx: &SessionContext<Bytes>) -> anyhow::Result<()> {
        let _ = self.events.send(Event::Open(ctx.id()));
        Ok(())
    }

    fn on_idle(&self, ctx: &SessionContext<Bytes>, status: IdleStatus) -> anyhow::Result<()> {
        let _ = self.events.send(Event::Idle(ctx.id(), status));
        Ok(())
    }

    fn on_close(&self, ctx: &SessionContext<Bytes>) {
        let _ = self.events.send(Event::Close(ctx.id()));
    }

    fn on_error(&self, ctx: &SessionContext<Bytes>, error: &ServerError) {
        let _ = self.events.send(Event::Error(ctx.id(), error.to_string()));
    }
}

/// Waits for `n` events.
pub fn next_events(rx: &Receiver<Event>, n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| {
            rx.recv_timeout(EVENT_TIMEOUT)
                .unwrap_or_else(|_| panic!("timed out waiting for event {} of {}", i + 1, n))
        })
        .collect()
}

/// Waits until `pred` matches an event, returning everything seen up to it.
pub fn wait_for(rx: &Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = rx
            .recv_timeout(EVENT_TIMEOUT)
            .unwrap_or_else(|_| panic!("timed out, events so far: {seen:?}"));
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}
