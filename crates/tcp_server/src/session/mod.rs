//! Session identity and per-connection bookkeeping.
//!
//! A [`Session`] is owned by the [`SessionRegistry`] from accept until close.
//! Everything else refers to it by [`SessionId`] or holds a copied
//! [`SessionInfo`].

mod registry;

pub use registry::{BroadcastReport, SessionRegistry};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime};

/// Process-wide id source; ids are never reused, even across server restarts.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocates the next id.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Copyable description of a session handed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub connected_at: SystemTime,
}

/// A live connection tracked by the registry.
#[derive(Debug)]
pub struct Session {
    info: SessionInfo,
    created: Instant,
    /// Milliseconds since `created` of the last inbound data.
    last_read_ms: AtomicU64,
    /// Milliseconds since `created` of the last flushed write.
    last_write_ms: AtomicU64,
    scheduled_writes: AtomicUsize,
    open: AtomicBool,
}

impl Session {
    pub(crate) fn new(remote_addr: SocketAddr) -> Self {
        Self {
            info: SessionInfo {
                id: SessionId::next(),
                remote_addr,
                connected_at: SystemTime::now(),
            },
            created: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            scheduled_writes: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> SessionId {
        self.info.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    pub fn info(&self) -> SessionInfo {
        self.info
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Time since the last inbound data (or since accept).
    pub fn read_idle_for(&self) -> std::time::Duration {
        self.idle_since(&self.last_read_ms)
    }

    /// Time since the last flushed write (or since accept).
    pub fn write_idle_for(&self) -> std::time::Duration {
        self.idle_since(&self.last_write_ms)
    }

    /// Number of encoded frames not yet flushed by the transport.
    pub fn scheduled_writes(&self) -> usize {
        self.scheduled_writes.load(Ordering::Acquire)
    }

    pub(crate) fn touch_read(&self) {
        self.last_read_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub(crate) fn touch_write(&self) {
        self.last_write_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Reserves a write slot. A `limit` of zero means unlimited.
    pub(crate) fn try_schedule_write(&self, limit: usize) -> bool {
        self.scheduled_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn complete_write(&self) {
        let _ = self
            .scheduled_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn idle_since(&self, mark: &AtomicU64) -> std::time::Duration {
        let since = self.elapsed_ms().saturating_sub(mark.load(Ordering::Relaxed));
        std::time::Duration::from_millis(since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_session_ids_are_monotonic() {
        let a = Session::new(addr());
        let b = Session::new(addr());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_scheduled_write_limit() {
        let session = Session::new(addr());
        assert!(session.try_schedule_write(2));
        assert!(session.try_schedule_write(2));
        assert!(!session.try_schedule_write(2));
        assert_eq!(session.scheduled_writes(), 2);

        session.complete_write();
        assert!(session.try_schedule_write(2));
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let session = Session::new(addr());
        for _ in 0..10_000 {
            assert!(session.try_schedule_write(0));
        }
        assert_eq!(session.scheduled_writes(), 10_000);
    }

    #[test]
    fn test_complete_write_never_underflows() {
        let session = Session::new(addr());
        session.complete_write();
        assert_eq!(session.scheduled_writes(), 0);
    }

    #[test]
    fn test_mark_closed() {
        let session = Session::new(addr());
        assert!(session.is_open());
        session.mark_closed();
        assert!(!session.is_open());
    }
}
