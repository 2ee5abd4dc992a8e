use std::path::PathBuf;

use thiserror::Error;

use crate::models::ConnectionStatus;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection {connection_id} is not ready (status: {status})")]
    NotReady {
        connection_id: String,
        status: ConnectionStatus,
    },

    #[error("Connection {0} already has an active session")]
    AlreadyActive(String),

    #[error("Session init failed for {connection_id}: {reason}")]
    SessionInit {
        connection_id: String,
        reason: String,
    },

    #[error("Message delivery failed for {connection_id}: {reason}")]
    Delivery {
        connection_id: String,
        reason: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Cleanup of {path} failed: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Stable machine-readable code used by the HTTP layer and CLI.
    pub fn code(&self) -> &'static str {
        match self {
            TetherError::Validation(_) => "validation",
            TetherError::NotFound(_) => "not_found",
            TetherError::NotReady { .. } => "not_ready",
            TetherError::AlreadyActive(_) => "already_active",
            TetherError::SessionInit { .. } => "session_init",
            TetherError::Delivery { .. } => "delivery",
            TetherError::Persistence(StoreError::NotFound(_)) => "not_found",
            TetherError::Persistence(_) => "persistence",
            TetherError::Cleanup { .. } => "cleanup",
            TetherError::Config(_) => "config",
            TetherError::Io(_) => "io",
        }
    }

    pub fn session_init(connection_id: &str, reason: impl Into<String>) -> Self {
        TetherError::SessionInit {
            connection_id: connection_id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
