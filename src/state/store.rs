//! Storage backends for the client state.
//!
//! Values are opaque strings scoped by terminal id. `SqliteBackend` is what the
//! server runs on; `MemoryBackend` keeps everything in a `DashMap` and backs the
//! tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::{QueryBuilder, Sqlite};

use super::StateKey;
use crate::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("client state storage failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode client state value: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, terminal: &str, key: StateKey) -> Result<Option<String>, StoreError>;

    async fn set(&self, terminal: &str, key: StateKey, value: &str) -> Result<(), StoreError>;

    /// Writes `value` only when the key is vacant. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        terminal: &str,
        key: StateKey,
        value: &str,
    ) -> Result<bool, StoreError>;

    async fn remove(&self, terminal: &str, key: StateKey) -> Result<(), StoreError>;

    /// Removes every key of the terminal except those listed in `keep`.
    async fn clear(&self, terminal: &str, keep: &[StateKey]) -> Result<(), StoreError>;
}

pub struct SqliteBackend {
    db: DbPool,
}

impl SqliteBackend {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    async fn get(&self, terminal: &str, key: StateKey) -> Result<Option<String>, StoreError> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM client_state WHERE terminal_id = ? AND key = ?")
                .bind(terminal)
                .bind(key.as_str())
                .fetch_optional(&self.db)
                .await?;
        Ok(value.map(|(v,)| v))
    }

    async fn set(&self, terminal: &str, key: StateKey, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO client_state (terminal_id, key, value, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(terminal_id, key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(terminal)
        .bind(key.as_str())
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        terminal: &str,
        key: StateKey,
        value: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO client_state (terminal_id, key, value, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(terminal_id, key) DO NOTHING
            "#,
        )
        .bind(terminal)
        .bind(key.as_str())
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, terminal: &str, key: StateKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM client_state WHERE terminal_id = ? AND key = ?")
            .bind(terminal)
            .bind(key.as_str())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn clear(&self, terminal: &str, keep: &[StateKey]) -> Result<(), StoreError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM client_state WHERE terminal_id = ");
        query.push_bind(terminal);
        if !keep.is_empty() {
            query.push(" AND key NOT IN (");
            let mut separated = query.separated(", ");
            for key in keep {
                separated.push_bind(key.as_str());
            }
            separated.push_unseparated(")");
        }
        query.build().execute(&self.db).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<(String, StateKey), String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all terminals
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get(&self, terminal: &str, key: StateKey) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .get(&(terminal.to_string(), key))
            .map(|v| v.value().clone()))
    }

    async fn set(&self, terminal: &str, key: StateKey, value: &str) -> Result<(), StoreError> {
        self.entries
            .insert((terminal.to_string(), key), value.to_string());
        Ok(())
    }

    async fn set_if_absent(
        &self,
        terminal: &str,
        key: StateKey,
        value: &str,
    ) -> Result<bool, StoreError> {
        match self.entries.entry((terminal.to_string(), key)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn remove(&self, terminal: &str, key: StateKey) -> Result<(), StoreError> {
        self.entries.remove(&(terminal.to_string(), key));
        Ok(())
    }

    async fn clear(&self, terminal: &str, keep: &[StateKey]) -> Result<(), StoreError> {
        self.entries
            .retain(|(owner, key), _| owner != terminal || keep.contains(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_backend() -> SqliteBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        SqliteBackend::new(pool)
    }

    async fn exercise(backend: &dyn StateBackend) {
        assert_eq!(backend.get("t1", StateKey::LastEvent).await.unwrap(), None);

        backend.set("t1", StateKey::LastEvent, "rock-fest").await.unwrap();
        backend.set("t1", StateKey::LastEvent, "jazz-night").await.unwrap();
        backend.set("t2", StateKey::LastEvent, "other").await.unwrap();
        assert_eq!(
            backend.get("t1", StateKey::LastEvent).await.unwrap().as_deref(),
            Some("jazz-night")
        );

        assert!(backend
            .set_if_absent("t1", StateKey::IssuanceStatus, "processing")
            .await
            .unwrap());
        assert!(!backend
            .set_if_absent("t1", StateKey::IssuanceStatus, "processing")
            .await
            .unwrap());
        // Different terminal, independent slot
        assert!(backend
            .set_if_absent("t2", StateKey::IssuanceStatus, "processing")
            .await
            .unwrap());

        backend.set("t1", StateKey::TenantCompanyId, "7").await.unwrap();
        backend
            .clear("t1", &[StateKey::LastEvent, StateKey::TenantCompanyId])
            .await
            .unwrap();
        assert_eq!(backend.get("t1", StateKey::IssuanceStatus).await.unwrap(), None);
        assert!(backend.get("t1", StateKey::LastEvent).await.unwrap().is_some());
        assert!(backend.get("t1", StateKey::TenantCompanyId).await.unwrap().is_some());
        assert!(backend.get("t2", StateKey::IssuanceStatus).await.unwrap().is_some());

        backend.remove("t1", StateKey::LastEvent).await.unwrap();
        assert_eq!(backend.get("t1", StateKey::LastEvent).await.unwrap(), None);

        backend.clear("t2", &[]).await.unwrap();
        assert_eq!(backend.get("t2", StateKey::LastEvent).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_backend_semantics() {
        let backend = MemoryBackend::new();
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn test_sqlite_backend_semantics() {
        let backend = sqlite_backend().await;
        exercise(&backend).await;
    }

    #[test]
    fn test_key_names_are_unique() {
        let mut names: Vec<&str> = StateKey::ALL.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), StateKey::ALL.len());
    }
}
