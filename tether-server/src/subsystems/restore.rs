//! Restoration of persisted sessions.
//!
//! At boot every connection persisted as `ready` is relaunched silently from
//! its stored credentials. Individual connections can also be restored on
//! demand; a restore on a disconnected or needs-restore connection may fall
//! back to QR pairing.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tether_core::{Connection, ConnectionStatus, ConnectionStore, TetherError, TetherResult};

use super::launcher::{LaunchOutcome, SessionLauncher};
use super::registry::{ClientRegistry, LaunchMode};

/// Summary of one `restore_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub total: usize,
    pub restored: usize,
    pub skipped: usize,
    pub needs_reauth: usize,
    pub failed: usize,
}

/// Result of restoring a single connection. Failures are reported in-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    pub success: bool,
    pub message: String,
    pub status: Option<ConnectionStatus>,
    pub qr_code: Option<String>,
    pub code: Option<String>,
}

impl RestoreResult {
    fn ok(message: impl Into<String>, status: ConnectionStatus, qr_code: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            status: Some(status),
            qr_code,
            code: None,
        }
    }

    fn failed(error: &TetherError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            status: None,
            qr_code: None,
            code: Some(error.code().to_string()),
        }
    }
}

enum Attempt {
    Restored,
    Skipped,
    NeedsReauth,
    Failed,
}

pub struct RestorationCoordinator {
    store: Arc<dyn ConnectionStore>,
    registry: Arc<ClientRegistry>,
    launcher: Arc<SessionLauncher>,
    concurrency: usize,
}

impl RestorationCoordinator {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        registry: Arc<ClientRegistry>,
        launcher: Arc<SessionLauncher>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            registry,
            launcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Relaunch every `ready` connection that has no live session.
    /// One connection failing never stops the others.
    pub async fn restore_all(&self) -> TetherResult<RestoreReport> {
        let connections = self.store.list_by_status(ConnectionStatus::Ready).await?;
        let mut report = RestoreReport {
            total: connections.len(),
            ..RestoreReport::default()
        };

        tracing::info!(total = report.total, concurrency = self.concurrency, "Restoring ready connections");

        let attempts: Vec<Attempt> = stream::iter(connections)
            .map(|connection| self.restore_silently(connection))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for attempt in attempts {
            match attempt {
                Attempt::Restored => report.restored += 1,
                Attempt::Skipped => report.skipped += 1,
                Attempt::NeedsReauth => report.needs_reauth += 1,
                Attempt::Failed => report.failed += 1,
            }
        }

        tracing::info!(
            restored = report.restored,
            skipped = report.skipped,
            needs_reauth = report.needs_reauth,
            failed = report.failed,
            "Restoration pass complete"
        );
        Ok(report)
    }

    async fn restore_silently(&self, connection: Connection) -> Attempt {
        let id = connection.id.as_str();
        if self.registry.has(id) {
            tracing::debug!(connection_id = %id, "Already active, skipping restore");
            return Attempt::Skipped;
        }

        match self.launcher.launch(id, &connection.owner_id, LaunchMode::Silent).await {
            Ok(LaunchOutcome::Ready) => Attempt::Restored,
            Ok(LaunchOutcome::CredentialsRejected) | Ok(LaunchOutcome::Qr(_)) => Attempt::NeedsReauth,
            Err(TetherError::AlreadyActive(_)) => Attempt::Skipped,
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Restore failed");
                Attempt::Failed
            }
        }
    }

    /// Restore one connection. Never fails; problems come back as
    /// `success = false` with an error code.
    pub async fn restore_one(&self, connection_id: &str) -> RestoreResult {
        match self.try_restore_one(connection_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Restore request failed");
                RestoreResult::failed(&e)
            }
        }
    }

    async fn try_restore_one(&self, connection_id: &str) -> TetherResult<RestoreResult> {
        if connection_id.trim().is_empty() {
            return Err(TetherError::Validation("connection id is required".to_string()));
        }

        let connection = self
            .store
            .get(connection_id)
            .await?
            .ok_or_else(|| TetherError::NotFound(format!("connection {}", connection_id)))?;

        if let Some(session) = self.registry.get(connection_id) {
            return Ok(RestoreResult::ok(
                "session already active",
                session.status,
                session.last_qr,
            ));
        }

        let mode = match connection.status {
            ConnectionStatus::Ready => LaunchMode::Silent,
            ConnectionStatus::Disconnected
            | ConnectionStatus::NeedsRestore
            | ConnectionStatus::RequestingQr
            | ConnectionStatus::WaitingConnection => LaunchMode::Restore,
            ConnectionStatus::AuthFailed | ConnectionStatus::Error => {
                return Err(TetherError::Validation(format!(
                    "connection {} is {} and cannot be restored; delete and re-add it",
                    connection_id, connection.status
                )));
            }
        };

        let result = match self.launcher.launch(connection_id, &connection.owner_id, mode).await? {
            LaunchOutcome::Ready => {
                RestoreResult::ok("session restored", ConnectionStatus::Ready, None)
            }
            LaunchOutcome::Qr(image) => RestoreResult::ok(
                "scan the QR code to re-authenticate",
                ConnectionStatus::WaitingConnection,
                Some(image),
            ),
            LaunchOutcome::CredentialsRejected => RestoreResult {
                success: false,
                message: "stored credentials rejected; restore again to re-pair".to_string(),
                status: Some(ConnectionStatus::NeedsRestore),
                qr_code: None,
                code: Some("needs_reauth".to_string()),
            },
        };
        Ok(result)
    }
}
