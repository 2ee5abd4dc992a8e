use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ConnectionStore, StoreError, StoreResult};
use crate::models::{Connection, ConnectionStatus};

/// Process-local connection store.
///
/// Writes can be switched to fail with `fail_writes(true)`, which lets tests
/// exercise the rollback paths of the lifecycle core.
#[derive(Debug, Default)]
pub struct MemoryConnectionStore {
    rows: RwLock<HashMap<String, Connection>>,
    fail_writes: AtomicBool,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

fn sorted(mut rows: Vec<Connection>) -> Vec<Connection> {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    rows
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn insert(&self, connection: &Connection) -> StoreResult<()> {
        self.check_writable()?;
        let mut rows = self.rows.write().await;
        if rows.contains_key(&connection.id) {
            return Err(StoreError::Duplicate(connection.id.clone()));
        }
        rows.insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Connection>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Connection>> {
        let rows = self.rows.read().await;
        Ok(sorted(
            rows.values()
                .filter(|c| c.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_status(&self, status: ConnectionStatus) -> StoreResult<Vec<Connection>> {
        let rows = self.rows.read().await;
        Ok(sorted(
            rows.values().filter(|c| c.status == status).cloned().collect(),
        ))
    }

    async fn update(&self, connection: &Connection) -> StoreResult<()> {
        self.check_writable()?;
        let mut rows = self.rows.write().await;
        let existing = rows
            .get_mut(&connection.id)
            .ok_or_else(|| StoreError::NotFound(connection.id.clone()))?;

        let owner_id = existing.owner_id.clone();
        let created_at = existing.created_at;
        *existing = connection.clone();
        existing.owner_id = owner_id;
        existing.created_at = created_at;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.rows.write().await.remove(id).is_some())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_writable()?;
        if let Some(row) = self.rows.write().await.get_mut(id) {
            row.last_activity = Some(at);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = MemoryConnectionStore::new();
        let conn = Connection::new("c1", "owner");
        store.insert(&conn).await.unwrap();
        assert!(matches!(
            store.insert(&conn).await,
            Err(StoreError::Duplicate(id)) if id == "c1"
        ));
    }

    #[tokio::test]
    async fn update_never_rewrites_owner() {
        let store = MemoryConnectionStore::new();
        let conn = Connection::new("c1", "owner-a");
        store.insert(&conn).await.unwrap();

        let mut changed = conn.clone();
        changed.owner_id = "owner-b".into();
        changed.status = ConnectionStatus::WaitingConnection;
        store.update(&changed).await.unwrap();

        let loaded = store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "owner-a");
        assert_eq!(loaded.status, ConnectionStatus::WaitingConnection);
    }

    #[tokio::test]
    async fn failing_writes_surface_database_errors() {
        let store = MemoryConnectionStore::new();
        store.insert(&Connection::new("c1", "owner")).await.unwrap();
        store.fail_writes(true);

        let conn = store.get("c1").await.unwrap().unwrap();
        assert!(matches!(store.update(&conn).await, Err(StoreError::Database(_))));
        // reads keep working
        assert!(store.get("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lists_filter_by_owner_and_status() {
        let store = MemoryConnectionStore::new();
        let mut ready = Connection::new("c1", "owner-a");
        ready.status = ConnectionStatus::Ready;
        store.insert(&ready).await.unwrap();
        store.insert(&Connection::new("c2", "owner-a")).await.unwrap();
        store.insert(&Connection::new("c3", "owner-b")).await.unwrap();

        assert_eq!(store.list_by_owner("owner-a").await.unwrap().len(), 2);
        let ready_rows = store.list_by_status(ConnectionStatus::Ready).await.unwrap();
        assert_eq!(ready_rows.len(), 1);
        assert_eq!(ready_rows[0].id, "c1");
    }

    #[tokio::test]
    async fn owner_listing_is_oldest_first() {
        let store = MemoryConnectionStore::new();
        let base = chrono::Utc::now();
        for (id, minutes) in [("newest", 10), ("oldest", 0), ("middle", 5)] {
            let mut conn = Connection::new(id, "owner-a");
            conn.created_at = base + chrono::Duration::minutes(minutes);
            store.insert(&conn).await.unwrap();
        }

        let ids: Vec<String> = store
            .list_by_owner("owner-a")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["oldest", "middle", "newest"]);
    }
}
