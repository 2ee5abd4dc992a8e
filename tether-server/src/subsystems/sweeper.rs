//! Cleanup sweeper: removes on-disk session artifacts of disconnected
//! connections, optionally prunes old disconnected records and orphaned
//! session directories.
//!
//! Runs on a fixed interval (and on demand). Ids with a live registry entry
//! are never touched, whatever their persisted status says. Filesystem
//! failures are logged and counted; they never abort a sweep.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tether_core::config::{CleanupConfig, SessionConfig, SESSION_DIR_PREFIX};
use tether_core::{ConnectionStatus, ConnectionStore, TetherError, TetherResult};
use tokio::sync::broadcast;

use super::locks::KeyedLocks;
use super::registry::ClientRegistry;

/// Report from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub skipped_active: usize,
    pub directories_removed: usize,
    pub records_pruned: usize,
    pub orphans_removed: usize,
    pub errors: usize,
}

/// Directory removal tally for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub removed: usize,
    pub errors: usize,
}

pub struct CleanupSweeper {
    store: Arc<dyn ConnectionStore>,
    registry: Arc<ClientRegistry>,
    locks: Arc<KeyedLocks>,
    session: SessionConfig,
    cleanup: CleanupConfig,
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        registry: Arc<ClientRegistry>,
        locks: Arc<KeyedLocks>,
        session: SessionConfig,
        cleanup: CleanupConfig,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            session,
            cleanup,
        }
    }

    /// Run one sweep. Only a failure to list disconnected records is
    /// returned; everything per-connection is logged and counted.
    pub async fn sweep(&self) -> TetherResult<SweepReport> {
        let mut report = SweepReport::default();
        let disconnected = self.store.list_by_status(ConnectionStatus::Disconnected).await?;
        let prune_before = self.cleanup.prune_disconnected_after_hours.and_then(|hours| {
            let cutoff = prune_cutoff(Utc::now(), hours);
            if cutoff.is_none() {
                tracing::warn!(hours, "prune_disconnected_after_hours is out of range, not pruning");
            }
            cutoff
        });

        for connection in disconnected {
            report.examined += 1;
            let id = connection.id.as_str();

            let _guard = self.locks.lock(id).await;
            if self.registry.has(id) {
                tracing::debug!(connection_id = %id, "Skipping sweep of active session");
                report.skipped_active += 1;
                continue;
            }

            let purge = self.remove_session_dirs(id).await;
            report.directories_removed += purge.removed;
            report.errors += purge.errors;

            let Some(cutoff) = prune_before else {
                continue;
            };
            let disconnected_at = connection.disconnected_at.unwrap_or(connection.created_at);
            if disconnected_at < cutoff {
                match self.store.delete(id).await {
                    Ok(true) => {
                        tracing::info!(connection_id = %id, "Pruned stale disconnected record");
                        report.records_pruned += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "Failed to prune record");
                        report.errors += 1;
                    }
                }
            }
        }

        if self.cleanup.remove_orphans {
            self.sweep_orphans(&mut report).await;
        }

        self.locks.prune_idle();

        tracing::info!(
            examined = report.examined,
            skipped_active = report.skipped_active,
            directories_removed = report.directories_removed,
            records_pruned = report.records_pruned,
            orphans_removed = report.orphans_removed,
            errors = report.errors,
            "Cleanup sweep complete"
        );
        Ok(report)
    }

    /// Delete one connection's auth and cache directories.
    pub async fn purge_artifacts(&self, connection_id: &str) -> PurgeOutcome {
        let _guard = self.locks.lock(connection_id).await;
        self.remove_session_dirs(connection_id).await
    }

    async fn remove_session_dirs(&self, connection_id: &str) -> PurgeOutcome {
        let mut outcome = PurgeOutcome::default();
        for dir in [
            self.session.auth_dir(connection_id),
            self.session.cache_dir(connection_id),
        ] {
            match remove_dir_if_exists(&dir).await {
                Ok(true) => {
                    tracing::debug!(connection_id = %connection_id, path = %dir.display(), "Removed session directory");
                    outcome.removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Cleanup failed");
                    outcome.errors += 1;
                }
            }
        }
        outcome
    }

    async fn sweep_orphans(&self, report: &mut SweepReport) {
        for root in self.session.roots() {
            let mut entries = match tokio::fs::read_dir(&root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %e, "Cannot scan session root");
                    report.errors += 1;
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(root = %root.display(), error = %e, "Session root scan interrupted");
                        report.errors += 1;
                        break;
                    }
                };

                let name = entry.file_name();
                let Some(id) = name.to_str().and_then(|n| n.strip_prefix(SESSION_DIR_PREFIX)) else {
                    continue;
                };
                if id.is_empty() {
                    continue;
                }

                let _guard = self.locks.lock(id).await;
                if self.registry.has(id) {
                    continue;
                }
                match self.store.get(id).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "Orphan check failed");
                        report.errors += 1;
                        continue;
                    }
                }

                match remove_dir_if_exists(&entry.path()).await {
                    Ok(true) => {
                        tracing::info!(connection_id = %id, path = %entry.path().display(), "Removed orphaned session directory");
                        report.orphans_removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "Cleanup failed");
                        report.errors += 1;
                    }
                }
            }
        }
    }
}

/// Remove `path` recursively. `Ok(false)` if it did not exist.
async fn remove_dir_if_exists(path: &Path) -> TetherResult<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(TetherError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Called from main.rs to run the periodic sweep until shutdown
pub async fn run_sweeper_loop(
    sweeper: Arc<CleanupSweeper>,
    interval_minutes: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Cleanup loop started (interval: {}min)", interval_minutes.max(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweeper.sweep().await {
                    tracing::error!("Cleanup sweep error: {}", e);
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Cleanup loop shutting down");
                break;
            }
        }
    }
}

/// Records disconnected before this instant are pruned. `None` when `hours`
/// does not fit in a time delta.
pub fn prune_cutoff(now: DateTime<Utc>, hours: u64) -> Option<DateTime<Utc>> {
    let hours = i64::try_from(hours).ok()?;
    now.checked_sub_signed(ChronoDuration::try_hours(hours)?)
}
