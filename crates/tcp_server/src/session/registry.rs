//! Registry of live sessions.
//!
//! The registry owns every [`Session`] from accept to close, hands out ids,
//! and implements broadcast-to-all over a consistent snapshot of the set.

use super::{Session, SessionId};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions present in the snapshot.
    pub attempted: usize,
    /// Sessions the payload was handed to.
    pub delivered: usize,
    /// Sessions whose write failed.
    pub failed: Vec<SessionId>,
}

/// Central registry for all live sessions.
///
/// Register, unregister and iteration are serialised by a single `RwLock`,
/// so none of them observes a half-applied change. The lock is a blocking
/// one: it is only held for map operations and is taken from transport
/// callbacks, dispatcher workers and async tasks alike.
///
/// A session accepted by the transport but not yet writable is held aside by
/// [`admit`](Self::admit) and only becomes visible on
/// [`activate`](Self::activate).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    pending: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly accepted connection and returns its session.
    ///
    /// # Arguments
    ///
    /// * `remote_addr` - The network address of the connecting peer
    pub fn register(&self, remote_addr: SocketAddr) -> Arc<Session> {
        let session = Arc::new(Session::new(remote_addr));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), Arc::clone(&session));
        info!("🔗 Session {} from {}", session.id(), remote_addr);
        session
    }

    /// Creates a session for a just-accepted connection without publishing it.
    ///
    /// The session is left out of lookups, counts and broadcasts until
    /// [`activate`](Self::activate) is called with the returned id.
    pub fn admit(&self, remote_addr: SocketAddr) -> SessionId {
        let session = Arc::new(Session::new(remote_addr));
        let id = session.id();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, session);
        id
    }

    /// Publishes an admitted session. Returns `None` if `id` is not pending.
    pub fn activate(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&session));
        info!("🔗 Session {} from {}", id, session.remote_addr());
        Some(session)
    }

    /// Removes a session and marks it closed.
    ///
    /// Returns `None` if the session was already gone, which makes repeated
    /// close notifications harmless. A session that was admitted but never
    /// activated is dropped and also reported as `None`.
    pub fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        if let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        {
            pending.mark_closed();
            return None;
        }

        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(session) = &removed {
            session.mark_closed();
            info!("❌ Session {} from {} closed", id, session.remote_addr());
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of currently registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Point-in-time copy of the session set.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Drops every session, marking each closed. Returns how many published
    /// sessions were removed.
    pub fn clear(&self) -> usize {
        for (_, pending) in self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            pending.mark_closed();
        }

        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &drained {
            session.mark_closed();
        }
        if !drained.is_empty() {
            debug!("🧹 Cleared {} sessions from registry", drained.len());
        }
        drained.len()
    }

    /// Hands the same encoded payload to every session in a snapshot.
    ///
    /// `write` is invoked exactly once per session present when the snapshot
    /// is taken. A failure is logged and recorded against that session only;
    /// the walk always continues. Sessions registered after the snapshot are
    /// not included.
    pub fn broadcast<F, E>(&self, payload: &Bytes, mut write: F) -> BroadcastReport
    where
        F: FnMut(&Session, Bytes) -> Result<(), E>,
        E: Display,
    {
        let targets = self.snapshot();
        let mut report = BroadcastReport {
            attempted: targets.len(),
            ..BroadcastReport::default()
        };

        for session in targets {
            match write(&session, payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session_id = %session.id(), "Broadcast to session failed: {}", e);
                    report.failed.push(session.id());
                }
            }
        }

        debug!(
            "📡 Broadcast delivered to {}/{} sessions",
            report.delivered, report.attempted
        );
        report
    }
}
