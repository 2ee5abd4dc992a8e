use std::path::PathBuf;

use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct TetherConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Which `ConnectionStore` implementation backs the service.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub auth_root: String,
    pub cache_root: String,
    pub jid_suffix: String,
    pub launch_timeout_secs: u64,
    pub restore_concurrency: usize,
    pub qr_persist_interval_secs: u64,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_root: "./data/auth".to_string(),
            cache_root: "./data/cache".to_string(),
            jid_suffix: "c.us".to_string(),
            launch_timeout_secs: 90,
            restore_concurrency: 4,
            qr_persist_interval_secs: 30,
            event_buffer: 32,
        }
    }
}

impl SessionConfig {
    /// `<auth_root>/session-<id>`, with `~` and env vars expanded.
    pub fn auth_dir(&self, connection_id: &str) -> PathBuf {
        expand_root(&self.auth_root).join(session_dir_name(connection_id))
    }

    /// `<cache_root>/session-<id>`, with `~` and env vars expanded.
    pub fn cache_dir(&self, connection_id: &str) -> PathBuf {
        expand_root(&self.cache_root).join(session_dir_name(connection_id))
    }

    pub fn roots(&self) -> [PathBuf; 2] {
        [expand_root(&self.auth_root), expand_root(&self.cache_root)]
    }
}

pub const SESSION_DIR_PREFIX: &str = "session-";

pub fn session_dir_name(connection_id: &str) -> String {
    format!("{}{}", SESSION_DIR_PREFIX, connection_id)
}

fn expand_root(root: &str) -> PathBuf {
    match shellexpand::full(root) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::warn!(root = %root, error = %e, "Failed to expand session root, using it verbatim");
            PathBuf::from(root)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub prune_disconnected_after_hours: Option<u64>,
    pub remove_orphans: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            prune_disconnected_after_hours: None,
            remove_orphans: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SidecarConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub max_poll_failures: u32,
    pub request_timeout_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3100".to_string(),
            poll_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 500,
            max_poll_failures: 10,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8780,
        }
    }
}

impl TetherConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}
