//! Durable storage for connection records.
//!
//! `ConnectionStore` is the seam between the lifecycle core and the database.
//! Two implementations ship with the crate:
//! - **PgConnectionStore**: the production store (table `connections`)
//! - **MemoryConnectionStore**: process-local store for tests and ephemeral runs

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Connection, ConnectionStatus};

pub use memory::MemoryConnectionStore;
pub use postgres::PgConnectionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Connection record not found: {0}")]
    NotFound(String),

    #[error("Connection record already exists: {0}")]
    Duplicate(String),

    #[error("Corrupt connection record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert a new record. Fails with `Duplicate` if the id is taken.
    async fn insert(&self, connection: &Connection) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Option<Connection>>;

    /// Oldest first (`created_at`, then `id`). Both list methods share this order.
    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Connection>>;

    async fn list_by_status(&self, status: ConnectionStatus) -> StoreResult<Vec<Connection>>;

    /// Overwrite every mutable column of an existing record.
    /// `owner_id` and `created_at` are never rewritten.
    async fn update(&self, connection: &Connection) -> StoreResult<()>;

    /// Returns `true` if a record was deleted.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Store backend name for logging.
    fn name(&self) -> &str;
}
