//! Session launcher: creates an external session, registers it and waits for
//! the first meaningful signal (QR, ready, or failure).
//!
//! Registration happens under the connection's keyed lock, so two concurrent
//! launches for one id cannot both succeed. The wait for the first signal
//! happens outside the lock; the event pump needs it to process that signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tether_core::config::SessionConfig;
use tether_core::{MessagingClient, SessionEvent, SessionOptions, TetherError, TetherResult};
use tokio::sync::{mpsc, oneshot};

use super::bridge::{destroy_quietly, EventBridge, EventOutcome};
use super::locks::KeyedLocks;
use super::registry::{ActiveSession, ClientRegistry, LaunchMode};

/// First signal of a launched session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Pairing needed; carries the rendered QR image.
    Qr(String),
    Ready,
    /// Silent launch only: stored credentials were rejected.
    CredentialsRejected,
}

pub struct SessionLauncher {
    client: Arc<dyn MessagingClient>,
    registry: Arc<ClientRegistry>,
    locks: Arc<KeyedLocks>,
    bridge: Arc<EventBridge>,
    config: SessionConfig,
}

impl SessionLauncher {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        registry: Arc<ClientRegistry>,
        locks: Arc<KeyedLocks>,
        bridge: Arc<EventBridge>,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            registry,
            locks,
            bridge,
            config,
        }
    }

    /// Launch a session for `connection_id` and wait (bounded by the launch
    /// timeout) for its first signal. On any failure the session is torn
    /// down, its registry entry removed and the record marked `disconnected`.
    pub async fn launch(
        &self,
        connection_id: &str,
        owner_id: &str,
        mode: LaunchMode,
    ) -> TetherResult<LaunchOutcome> {
        if connection_id.trim().is_empty() {
            return Err(TetherError::Validation("connection id is required".to_string()));
        }

        let (token, first_signal) = self.register(connection_id, owner_id, mode).await?;

        let wait = Duration::from_secs(self.config.launch_timeout_secs);
        let outcome = match tokio::time::timeout(wait, first_signal).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => EventOutcome::Failed("event stream ended before the first signal".to_string()),
            Err(_) => EventOutcome::Failed(format!(
                "no QR or ready event within {}s",
                self.config.launch_timeout_secs
            )),
        };

        match outcome {
            EventOutcome::Qr(image) => Ok(LaunchOutcome::Qr(image)),
            EventOutcome::Ready => Ok(LaunchOutcome::Ready),
            EventOutcome::CredentialsRejected => Ok(LaunchOutcome::CredentialsRejected),
            EventOutcome::Failed(reason) => {
                self.abort(connection_id, token, mode, &reason).await;
                Err(TetherError::session_init(connection_id, reason))
            }
            EventOutcome::Ignored => {
                let reason = "session was superseded before it started".to_string();
                self.abort(connection_id, token, mode, &reason).await;
                Err(TetherError::session_init(connection_id, reason))
            }
        }
    }

    async fn register(
        &self,
        connection_id: &str,
        owner_id: &str,
        mode: LaunchMode,
    ) -> TetherResult<(u64, oneshot::Receiver<EventOutcome>)> {
        let _guard = self.locks.lock(connection_id).await;

        if self.registry.has(connection_id) {
            return Err(TetherError::AlreadyActive(connection_id.to_string()));
        }

        let options = SessionOptions {
            auth_dir: self.config.auth_dir(connection_id),
            cache_dir: self.config.cache_dir(connection_id),
            resume: mode.resumes(),
        };

        tracing::info!(
            connection_id = %connection_id,
            mode = ?mode,
            client = self.client.name(),
            "Launching session"
        );

        let parts = match self.client.create_session(connection_id, options).await {
            Ok(parts) => parts,
            Err(e) => {
                let reason = format!("client creation failed: {}", e);
                tracing::error!(connection_id = %connection_id, reason = %reason, "Session launch failed");
                self.mark_disconnected(connection_id, mode, &reason).await;
                return Err(TetherError::session_init(connection_id, reason));
            }
        };

        let token = self.registry.next_token();
        let session = ActiveSession::new(connection_id, owner_id, mode, token, parts.handle.clone());
        if let Err(e) = self.registry.put(session) {
            destroy_quietly(connection_id, parts.handle.as_ref()).await;
            return Err(e);
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(pump_events(
            self.bridge.clone(),
            self.registry.clone(),
            connection_id.to_string(),
            token,
            parts.events,
            tx,
        ));

        Ok((token, rx))
    }

    /// Tear down a launch that failed to start. If the bridge already retired
    /// the entry (terminal event), it also persisted the outcome.
    async fn abort(&self, connection_id: &str, token: u64, mode: LaunchMode, reason: &str) {
        let _guard = self.locks.lock(connection_id).await;
        let Some(session) = self.registry.remove_if_token(connection_id, token) else {
            return;
        };
        tracing::warn!(connection_id = %connection_id, reason = %reason, "Aborting session launch");
        destroy_quietly(connection_id, session.handle.as_ref()).await;
        self.mark_disconnected(connection_id, mode, reason).await;
    }

    /// Best-effort `disconnected` write. Callers hold the keyed lock.
    async fn mark_disconnected(&self, connection_id: &str, mode: LaunchMode, reason: &str) {
        let kind = mode.transition_kind();
        let result = self
            .bridge
            .persist_with(connection_id, |conn| {
                conn.mark_disconnected(reason, kind, Utc::now())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(connection_id = %connection_id, error = %e, "Could not mark connection disconnected");
        }
    }
}

/// Feed one session's events through the bridge in order. The first
/// meaningful outcome is reported to the waiting launcher; the pump stops
/// once the launch no longer owns the registry entry.
async fn pump_events(
    bridge: Arc<EventBridge>,
    registry: Arc<ClientRegistry>,
    connection_id: String,
    token: u64,
    mut events: mpsc::Receiver<SessionEvent>,
    first_signal: oneshot::Sender<EventOutcome>,
) {
    let mut first_signal = Some(first_signal);

    while let Some(event) = events.recv().await {
        let outcome = bridge.handle(&connection_id, token, event).await;
        let ready = outcome == EventOutcome::Ready;
        if outcome != EventOutcome::Ignored {
            if let Some(tx) = first_signal.take() {
                let _ = tx.send(outcome);
            }
        }
        if ready {
            let bridge = bridge.clone();
            let id = connection_id.clone();
            tokio::spawn(async move { bridge.capture_account_info(&id, token).await });
        }
        if !registry.is_current(&connection_id, token) {
            tracing::debug!(connection_id = %connection_id, token, "Event pump finished");
            return;
        }
    }

    let outcome = bridge.on_stream_closed(&connection_id, token).await;
    if let Some(tx) = first_signal.take() {
        let _ = tx.send(outcome);
    }
}
