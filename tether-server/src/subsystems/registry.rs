//! In-memory registry of active sessions, keyed by connection id.
//!
//! The registry is the only owner of `ActiveSession`s. Every operation is
//! atomic per key (sharded map); multi-step operations on one id are
//! serialized by `KeyedLocks` at the call sites.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_core::{ConnectionStatus, LiveSnapshot, SessionHandle, TetherError, TetherResult, TransitionKind};

/// Why a session was launched. Decides which status edges its events may take
/// and how an unexpected QR is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// First pairing of a new connection.
    Fresh,
    /// Explicit restore of a disconnected / needs-restore connection; a QR is acceptable.
    Restore,
    /// Resume from stored credentials; a QR means the credentials were rejected.
    Silent,
}

impl LaunchMode {
    pub fn transition_kind(self) -> TransitionKind {
        match self {
            LaunchMode::Restore => TransitionKind::Restore,
            LaunchMode::Fresh | LaunchMode::Silent => TransitionKind::Automatic,
        }
    }

    pub fn resumes(self) -> bool {
        self != LaunchMode::Fresh
    }
}

#[derive(Clone)]
pub struct ActiveSession {
    pub connection_id: String,
    pub owner_id: String,
    pub status: ConnectionStatus,
    pub last_qr: Option<String>,
    pub mode: LaunchMode,
    /// Unique per launch; events from a superseded launch carry a stale token.
    pub token: u64,
    pub handle: Arc<dyn SessionHandle>,
    pub started_at: DateTime<Utc>,
    pub qr_persisted_at: Option<Instant>,
}

impl ActiveSession {
    pub fn new(
        connection_id: impl Into<String>,
        owner_id: impl Into<String>,
        mode: LaunchMode,
        token: u64,
        handle: Arc<dyn SessionHandle>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            owner_id: owner_id.into(),
            status: ConnectionStatus::RequestingQr,
            last_qr: None,
            mode,
            token,
            handle,
            started_at: Utc::now(),
            qr_persisted_at: None,
        }
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            status: self.status,
            last_qr: self.last_qr.clone(),
        }
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("connection_id", &self.connection_id)
            .field("owner_id", &self.owner_id)
            .field("status", &self.status)
            .field("mode", &self.mode)
            .field("token", &self.token)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

pub struct ClientRegistry {
    sessions: DashMap<String, ActiveSession>,
    next_token: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session. An id that already has an entry is an error;
    /// the existing entry is never replaced.
    pub fn put(&self, session: ActiveSession) -> TetherResult<()> {
        match self.sessions.entry(session.connection_id.clone()) {
            Entry::Occupied(entry) => Err(TetherError::AlreadyActive(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    connection_id = %session.connection_id,
                    token = session.token,
                    mode = ?session.mode,
                    "session registered"
                );
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<ActiveSession> {
        self.sessions.get(connection_id).map(|s| s.value().clone())
    }

    pub fn has(&self, connection_id: &str) -> bool {
        self.sessions.contains_key(connection_id)
    }

    /// `true` if the entry for `connection_id` belongs to the launch `token`.
    pub fn is_current(&self, connection_id: &str, token: u64) -> bool {
        self.sessions
            .get(connection_id)
            .is_some_and(|s| s.token == token)
    }

    pub fn remove(&self, connection_id: &str) -> Option<ActiveSession> {
        self.sessions.remove(connection_id).map(|(_, s)| s)
    }

    /// Remove the entry only if it belongs to the launch `token`.
    pub fn remove_if_token(&self, connection_id: &str, token: u64) -> Option<ActiveSession> {
        self.sessions
            .remove_if(connection_id, |_, s| s.token == token)
            .map(|(_, s)| s)
    }

    /// Apply `f` to the entry of launch `token`. Returns `false` when the
    /// entry is gone or belongs to another launch.
    pub fn update<F>(&self, connection_id: &str, token: u64, f: F) -> bool
    where
        F: FnOnce(&mut ActiveSession),
    {
        match self.sessions.get_mut(connection_id) {
            Some(mut entry) if entry.token == token => {
                f(entry.value_mut());
                true
            }
            _ => false,
        }
    }

    pub fn set_status(&self, connection_id: &str, token: u64, status: ConnectionStatus) -> bool {
        self.update(connection_id, token, |s| s.status = status)
    }

    pub fn set_qr(&self, connection_id: &str, token: u64, qr: String) -> bool {
        self.update(connection_id, token, |s| s.last_qr = Some(qr))
    }

    pub fn list_all(&self) -> Vec<ActiveSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<ActiveSession> {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        ids.into_iter().filter_map(|id| self.remove(&id)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
