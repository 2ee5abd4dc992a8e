//! Event bridge: turns session lifecycle events into persisted status changes.
//!
//! Every event is handled under the connection's keyed lock and only if the
//! registry entry still belongs to the launch that produced it. A ready
//! status is persisted before the registry reports it, so no caller can see a
//! live `ready` that the store does not hold. Failures here are logged and
//! never escape into other connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tether_core::{
    qr, Connection, ConnectionStatus, ConnectionStore, SessionEvent, SessionHandle, TetherError,
    TetherResult,
};

use super::locks::KeyedLocks;
use super::registry::{ActiveSession, ClientRegistry, LaunchMode};

const ACCOUNT_INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// What a processed event means to whoever is waiting on the launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A QR image (data URL, or the raw payload if rendering failed).
    Qr(String),
    Ready,
    /// A silent restore was answered with a QR; the record is now `needs_restore`.
    CredentialsRejected,
    /// The session ended; the string is the reason.
    Failed(String),
    /// Stale or unknown session; nothing changed.
    Ignored,
}

pub struct EventBridge {
    store: Arc<dyn ConnectionStore>,
    registry: Arc<ClientRegistry>,
    locks: Arc<KeyedLocks>,
    qr_persist_interval: Duration,
}

impl EventBridge {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        registry: Arc<ClientRegistry>,
        locks: Arc<KeyedLocks>,
        qr_persist_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            qr_persist_interval,
        }
    }

    pub async fn handle(&self, connection_id: &str, token: u64, event: SessionEvent) -> EventOutcome {
        match event {
            SessionEvent::Qr(raw) => self.on_qr(connection_id, token, &raw).await,
            SessionEvent::Ready => self.on_ready(connection_id, token).await,
            SessionEvent::AuthFailure(message) => {
                self.on_auth_failure(connection_id, token, &message).await
            }
            SessionEvent::Disconnected(reason) => {
                self.on_disconnected(connection_id, token, &reason).await
            }
        }
    }

    /// The session's event stream ended without a terminal event.
    pub async fn on_stream_closed(&self, connection_id: &str, token: u64) -> EventOutcome {
        if !self.registry.is_current(connection_id, token) {
            return EventOutcome::Ignored;
        }
        self.on_disconnected(connection_id, token, "event stream closed").await
    }

    async fn on_qr(&self, connection_id: &str, token: u64, raw: &str) -> EventOutcome {
        let image = qr::render_or_raw(raw);

        let _guard = self.locks.lock(connection_id).await;
        let Some(session) = self.current(connection_id, token) else {
            return EventOutcome::Ignored;
        };

        if session.mode == LaunchMode::Silent {
            tracing::warn!(connection_id = %connection_id, "Stored credentials rejected during restoration");
            self.flag_needs_restore(&session).await;
            return EventOutcome::CredentialsRejected;
        }

        let now = Instant::now();
        let persist = session
            .qr_persisted_at
            .map_or(true, |at| now.duration_since(at) >= self.qr_persist_interval);

        self.registry.update(connection_id, token, |s| {
            s.status = ConnectionStatus::WaitingConnection;
            s.last_qr = Some(image.clone());
            if persist {
                s.qr_persisted_at = Some(now);
            }
        });

        if persist {
            let kind = session.mode.transition_kind();
            let result = self
                .persist_with(connection_id, |conn| conn.mark_qr(image.clone(), kind, Utc::now()))
                .await;
            if let Err(e) = result {
                tracing::warn!(connection_id = %connection_id, error = %e, "Failed to persist QR");
            }
        } else {
            tracing::debug!(connection_id = %connection_id, "QR rotated (persistence throttled)");
        }

        EventOutcome::Qr(image)
    }

    async fn on_ready(&self, connection_id: &str, token: u64) -> EventOutcome {
        let _guard = self.locks.lock(connection_id).await;
        let Some(session) = self.current(connection_id, token) else {
            return EventOutcome::Ignored;
        };

        let kind = session.mode.transition_kind();
        match self
            .persist_with(connection_id, |conn| conn.mark_ready(kind, Utc::now()))
            .await
        {
            Ok(_) => {
                self.registry
                    .set_status(connection_id, token, ConnectionStatus::Ready);
                tracing::info!(connection_id = %connection_id, "Connection ready");
                EventOutcome::Ready
            }
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "Failed to persist ready state");
                self.registry
                    .set_status(connection_id, token, ConnectionStatus::WaitingConnection);
                EventOutcome::Failed(format!("failed to persist ready state: {}", e))
            }
        }
    }

    async fn on_auth_failure(&self, connection_id: &str, token: u64, message: &str) -> EventOutcome {
        let _guard = self.locks.lock(connection_id).await;
        let Some(session) = self.current(connection_id, token) else {
            return EventOutcome::Ignored;
        };

        tracing::warn!(connection_id = %connection_id, message = %message, "Authentication failed");
        if let Err(e) = self
            .persist_with(connection_id, |conn| conn.mark_auth_failed(message, Utc::now()))
            .await
        {
            tracing::error!(connection_id = %connection_id, error = %e, "Failed to persist auth failure");
        }

        self.teardown(&session).await;
        EventOutcome::Failed(format!("authentication failed: {}", message))
    }

    async fn on_disconnected(&self, connection_id: &str, token: u64, reason: &str) -> EventOutcome {
        let _guard = self.locks.lock(connection_id).await;
        let Some(session) = self.current(connection_id, token) else {
            return EventOutcome::Ignored;
        };

        tracing::info!(connection_id = %connection_id, reason = %reason, "Connection disconnected");
        let kind = session.mode.transition_kind();
        if let Err(e) = self
            .persist_with(connection_id, |conn| {
                conn.mark_disconnected(reason, kind, Utc::now())
            })
            .await
        {
            tracing::error!(connection_id = %connection_id, error = %e, "Failed to persist disconnect");
        }

        // the entry goes away even when persistence failed
        self.teardown(&session).await;
        EventOutcome::Failed(format!("disconnected: {}", reason))
    }

    /// Load the record, apply `f`, write it back. Callers hold the keyed lock.
    pub(crate) async fn persist_with<F>(&self, connection_id: &str, f: F) -> TetherResult<Connection>
    where
        F: FnOnce(&mut Connection) -> TetherResult<()>,
    {
        let mut connection = self
            .store
            .get(connection_id)
            .await?
            .ok_or_else(|| TetherError::NotFound(format!("connection {}", connection_id)))?;
        f(&mut connection)?;
        self.store.update(&connection).await?;
        Ok(connection)
    }

    /// Remove the launch's registry entry (if still current) and close its handle.
    pub(crate) async fn teardown(&self, session: &ActiveSession) {
        self.registry
            .remove_if_token(&session.connection_id, session.token);
        destroy_quietly(&session.connection_id, session.handle.as_ref()).await;
    }

    fn current(&self, connection_id: &str, token: u64) -> Option<ActiveSession> {
        match self.registry.get(connection_id) {
            Some(session) if session.token == token => Some(session),
            _ => {
                tracing::debug!(connection_id = %connection_id, token, "Ignoring event for stale session");
                None
            }
        }
    }

    async fn flag_needs_restore(&self, session: &ActiveSession) {
        let connection_id = &session.connection_id;
        if let Err(e) = self
            .persist_with(connection_id, |conn| {
                conn.mark_needs_restore("stored credentials rejected; re-authentication required")
            })
            .await
        {
            tracing::error!(connection_id = %connection_id, error = %e, "Failed to flag connection for restore");
        }
        self.teardown(session).await;
    }

    /// Fetch account metadata for a ready session and store it. Runs apart
    /// from the event pump; the outcome never changes the session's status.
    pub async fn capture_account_info(&self, connection_id: &str, token: u64) {
        let Some(handle) = self
            .registry
            .get(connection_id)
            .filter(|s| s.token == token)
            .map(|s| s.handle)
        else {
            return;
        };

        let info = match tokio::time::timeout(ACCOUNT_INFO_TIMEOUT, handle.account_info()).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Account info unavailable");
                return;
            }
            Err(_) => {
                tracing::warn!(connection_id = %connection_id, "Account info request timed out");
                return;
            }
        };

        let _guard = self.locks.lock(connection_id).await;
        if !self.registry.is_current(connection_id, token) {
            return;
        }
        let result = self
            .persist_with(connection_id, |conn| {
                if conn.status != ConnectionStatus::Ready {
                    return Err(TetherError::Validation(format!(
                        "connection {} left ready before account info arrived",
                        connection_id
                    )));
                }
                conn.account_info = Some(info);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(connection_id = %connection_id, error = %e, "Failed to store account info");
        }
    }
}

/// Destroy a session handle, logging instead of failing.
pub(crate) async fn destroy_quietly(connection_id: &str, handle: &dyn SessionHandle) {
    if let Err(e) = handle.destroy().await {
        tracing::warn!(connection_id = %connection_id, error = %e, "Failed to destroy session");
    }
}
