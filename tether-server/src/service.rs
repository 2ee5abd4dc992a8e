//! `ConnectionService`: the lifecycle core as one shared object.
//!
//! Built once in `main` (or a test) and shared behind an `Arc`. Owns the
//! registry, the keyed locks and every subsystem; the HTTP layer only talks
//! to this type.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tether_core::{
    Connection, ConnectionStatus, ConnectionStore, ConnectionView, MessageContent,
    MessagingClient, SendAck, TetherConfig, TetherError, TetherResult,
};
use uuid::Uuid;

use crate::subsystems::bridge::{destroy_quietly, EventBridge};
use crate::subsystems::dispatcher::MessageDispatcher;
use crate::subsystems::launcher::{LaunchOutcome, SessionLauncher};
use crate::subsystems::locks::KeyedLocks;
use crate::subsystems::registry::{ClientRegistry, LaunchMode};
use crate::subsystems::restore::{RestorationCoordinator, RestoreReport, RestoreResult};
use crate::subsystems::sweeper::{CleanupSweeper, SweepReport};

pub const MANUAL_DISCONNECT_REASON: &str = "manual disconnect";

/// A newly created connection and the QR to pair it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedConnection {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub qr: Option<String>,
}

pub struct ConnectionService {
    store: Arc<dyn ConnectionStore>,
    registry: Arc<ClientRegistry>,
    locks: Arc<KeyedLocks>,
    bridge: Arc<EventBridge>,
    launcher: Arc<SessionLauncher>,
    restorer: RestorationCoordinator,
    sweeper: Arc<CleanupSweeper>,
    dispatcher: MessageDispatcher,
}

impl ConnectionService {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        client: Arc<dyn MessagingClient>,
        config: &TetherConfig,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let locks = Arc::new(KeyedLocks::new());
        let session = config.session.clone();

        let bridge = Arc::new(EventBridge::new(
            store.clone(),
            registry.clone(),
            locks.clone(),
            Duration::from_secs(session.qr_persist_interval_secs),
        ));
        let launcher = Arc::new(SessionLauncher::new(
            client,
            registry.clone(),
            locks.clone(),
            bridge.clone(),
            session.clone(),
        ));
        let restorer = RestorationCoordinator::new(
            store.clone(),
            registry.clone(),
            launcher.clone(),
            session.restore_concurrency,
        );
        let sweeper = Arc::new(CleanupSweeper::new(
            store.clone(),
            registry.clone(),
            locks.clone(),
            session.clone(),
            config.cleanup.clone(),
        ));
        let dispatcher = MessageDispatcher::new(registry.clone(), session.jid_suffix.clone());

        Self {
            store,
            registry,
            locks,
            bridge,
            launcher,
            restorer,
            sweeper,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn sweeper(&self) -> Arc<CleanupSweeper> {
        self.sweeper.clone()
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Create a connection for `owner_id` and start pairing it.
    pub async fn add_connection(&self, owner_id: &str) -> TetherResult<AddedConnection> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(TetherError::Validation("owner_id is required".to_string()));
        }

        let connection_id = Uuid::new_v4().to_string();
        self.store
            .insert(&Connection::new(connection_id.as_str(), owner_id))
            .await?;
        tracing::info!(connection_id = %connection_id, owner_id = %owner_id, "Connection created");

        match self
            .launcher
            .launch(&connection_id, owner_id, LaunchMode::Fresh)
            .await?
        {
            LaunchOutcome::Qr(image) => Ok(AddedConnection {
                connection_id,
                status: ConnectionStatus::WaitingConnection,
                qr: Some(image),
            }),
            LaunchOutcome::Ready => Ok(AddedConnection {
                connection_id,
                status: ConnectionStatus::Ready,
                qr: None,
            }),
            LaunchOutcome::CredentialsRejected => Err(TetherError::session_init(
                &connection_id,
                "fresh session reported rejected credentials",
            )),
        }
    }

    pub async fn get_status(&self, connection_id: &str) -> TetherResult<ConnectionView> {
        let connection = self
            .store
            .get(connection_id)
            .await?
            .ok_or_else(|| TetherError::NotFound(format!("connection {}", connection_id)))?;
        let live = self.registry.get(connection_id).map(|s| s.snapshot());
        Ok(ConnectionView::new(connection, live))
    }

    pub async fn list_connections(&self, owner_id: &str) -> TetherResult<Vec<ConnectionView>> {
        if owner_id.trim().is_empty() {
            return Err(TetherError::Validation("owner_id is required".to_string()));
        }
        let connections = self.store.list_by_owner(owner_id.trim()).await?;
        Ok(connections
            .into_iter()
            .map(|connection| {
                let live = self.registry.get(&connection.id).map(|s| s.snapshot());
                ConnectionView::new(connection, live)
            })
            .collect())
    }

    /// Close a live session and mark it `disconnected`. A second call finds
    /// nothing to disconnect and returns `NotFound`.
    pub async fn disconnect(&self, connection_id: &str) -> TetherResult<()> {
        let _guard = self.locks.lock(connection_id).await;
        let session = self.registry.remove(connection_id).ok_or_else(|| {
            TetherError::NotFound(format!("no active session for connection {}", connection_id))
        })?;

        destroy_quietly(connection_id, session.handle.as_ref()).await;

        let kind = session.mode.transition_kind();
        let result = self
            .bridge
            .persist_with(connection_id, |conn| {
                conn.mark_disconnected(MANUAL_DISCONNECT_REASON, kind, Utc::now())
            })
            .await;

        match result {
            Ok(_) => {
                tracing::info!(connection_id = %connection_id, "Connection disconnected manually");
                Ok(())
            }
            Err(TetherError::Validation(message)) => {
                tracing::warn!(connection_id = %connection_id, message = %message, "Disconnect not recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn restore(&self, connection_id: &str) -> RestoreResult {
        self.restorer.restore_one(connection_id).await
    }

    pub async fn restore_all(&self) -> TetherResult<RestoreReport> {
        self.restorer.restore_all().await
    }

    /// Send through the connection's live session; bumps `last_activity`.
    pub async fn send_message(
        &self,
        connection_id: &str,
        to: &str,
        content: &MessageContent,
    ) -> TetherResult<SendAck> {
        let ack = self.dispatcher.send(connection_id, to, content).await?;
        if let Err(e) = self.store.touch(connection_id, Utc::now()).await {
            tracing::warn!(connection_id = %connection_id, error = %e, "Failed to record activity");
        }
        Ok(ack)
    }

    /// Remove a connection entirely: session, record and on-disk artifacts.
    pub async fn delete_connection(&self, connection_id: &str) -> TetherResult<()> {
        if self.store.get(connection_id).await?.is_none() {
            return Err(TetherError::NotFound(format!("connection {}", connection_id)));
        }

        match self.disconnect(connection_id).await {
            Ok(()) | Err(TetherError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Disconnect before delete failed");
            }
        }

        if !self.store.delete(connection_id).await? {
            return Err(TetherError::NotFound(format!("connection {}", connection_id)));
        }

        let purge = self.sweeper.purge_artifacts(connection_id).await;
        tracing::info!(
            connection_id = %connection_id,
            directories_removed = purge.removed,
            cleanup_errors = purge.errors,
            "Connection deleted"
        );
        Ok(())
    }

    pub async fn sweep(&self) -> TetherResult<SweepReport> {
        self.sweeper.sweep().await
    }

    /// Close every live session without touching persisted status, so the
    /// connections are restored at the next boot.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        tracing::info!(active = sessions.len(), "Closing active sessions");
        for session in sessions {
            destroy_quietly(&session.connection_id, session.handle.as_ref()).await;
        }
    }
}
