//! SQLite-backed sandbox and warm pool stores.
//!
//! Rows keep the full record as JSON in `data`; the columns next to it exist
//! for constraints and lookups and are rewritten on every update.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool},
};

use crate::{
    Error, Result,
    store::{SandboxStore, WarmPoolStore},
    types::Sandbox,
    warm_pool::WarmPool,
};

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn decode<T: serde::de::DeserializeOwned>(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<T>> {
    rows.iter()
        .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("data"))?))
        .collect()
}

fn name_taken(e: sqlx::Error, name: &str) -> Error {
    if is_unique_violation(&e) {
        Error::conflict(format!("sandbox with name {name} already exists"))
    } else {
        e.into()
    }
}

pub struct SqliteSandboxStore {
    pool: SqlitePool,
}

impl SqliteSandboxStore {
    /// Create a store on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SandboxStore for SqliteSandboxStore {
    async fn insert(&self, sandbox: &Sandbox) -> Result<()> {
        let data = serde_json::to_string(sandbox)?;
        sqlx::query(
            "INSERT INTO sandboxes (id, organization_id, name, state, desired_state, runner_id, pool_id, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&sandbox.id)
        .bind(&sandbox.organization_id)
        .bind(&sandbox.name)
        .bind(sandbox.state.as_str())
        .bind(sandbox.desired_state.as_str())
        .bind(&sandbox.runner_id)
        .bind(&sandbox.pool_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| name_taken(e, &sandbox.name))?;
        Ok(())
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<()> {
        let data = serde_json::to_string(sandbox)?;
        let result = sqlx::query(
            "UPDATE sandboxes
             SET name = ?, state = ?, desired_state = ?, runner_id = ?, pool_id = ?, data = ?
             WHERE id = ?",
        )
        .bind(&sandbox.name)
        .bind(sandbox.state.as_str())
        .bind(sandbox.desired_state.as_str())
        .bind(&sandbox.runner_id)
        .bind(&sandbox.pool_id)
        .bind(&data)
        .bind(&sandbox.id)
        .execute(&self.pool)
        .await
        .map_err(|e| name_taken(e, &sandbox.name))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(&sandbox.id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Sandbox>> {
        let rows = sqlx::query("SELECT data FROM sandboxes WHERE id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Sandbox>> {
        let rows = sqlx::query(
            "SELECT data FROM sandboxes
             WHERE organization_id = ? AND name = ? AND state != 'destroyed'",
        )
        .bind(organization_id)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn list(&self, organization_id: &str) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            "SELECT data FROM sandboxes
             WHERE organization_id = ? AND state != 'destroyed' ORDER BY rowid",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        decode(&rows)
    }

    async fn list_on_runner(&self, runner_id: &str) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            "SELECT data FROM sandboxes
             WHERE runner_id = ? AND state != 'destroyed' ORDER BY rowid",
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;
        decode(&rows)
    }

    async fn list_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            "SELECT data FROM sandboxes
             WHERE state != 'destroyed' AND (?1 IS NULL OR id > ?1)
             ORDER BY id LIMIT ?2",
        )
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        decode(&rows)
    }

    async fn list_pool_members(&self, pool_id: &str) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            "SELECT data FROM sandboxes
             WHERE pool_id = ? AND state != 'destroyed' ORDER BY rowid",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await?;
        decode(&rows)
    }
}

pub struct SqliteWarmPoolStore {
    pool: SqlitePool,
}

impl SqliteWarmPoolStore {
    /// Create a store on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WarmPoolStore for SqliteWarmPoolStore {
    async fn upsert_pool(&self, pool: &WarmPool) -> Result<()> {
        let data = serde_json::to_string(pool)?;
        sqlx::query(
            "INSERT INTO warm_pools (id, organization_id, data) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        )
        .bind(&pool.id)
        .bind(&pool.organization_id)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pool(&self, id: &str) -> Result<Option<WarmPool>> {
        let rows = sqlx::query("SELECT data FROM warm_pools WHERE id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn list_pools(&self) -> Result<Vec<WarmPool>> {
        let rows = sqlx::query("SELECT data FROM warm_pools ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        decode(&rows)
    }

    async fn list_pools_for(&self, organization_id: &str) -> Result<Vec<WarmPool>> {
        let rows = sqlx::query("SELECT data FROM warm_pools WHERE organization_id = ? ORDER BY rowid")
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        decode(&rows)
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM warm_pools WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{NewSandbox, SandboxState},
        sqlx::sqlite::SqlitePoolOptions,
    };

    async fn pool() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("corral.db").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn round_trips_and_enforces_names() {
        let (pool, _dir) = pool().await;
        let store = SqliteSandboxStore::with_pool(pool);
        let mut sandbox = NewSandbox::new("org", "dev", "eu").into_sandbox();
        sandbox.runner_id = Some("r1".into());
        store.insert(&sandbox).await.unwrap();
        assert!(matches!(
            store
                .insert(&NewSandbox::new("org", "dev", "eu").into_sandbox())
                .await,
            Err(Error::Conflict(_))
        ));

        sandbox.state = SandboxState::Started;
        store.update(&sandbox).await.unwrap();
        let loaded = store.get(&sandbox.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SandboxState::Started);
        assert_eq!(store.list_on_runner("r1").await.unwrap().len(), 1);

        sandbox.state = SandboxState::Destroyed;
        store.update(&sandbox).await.unwrap();
        assert!(store.find_by_name("org", "dev").await.unwrap().is_none());
        store
            .insert(&NewSandbox::new("org", "dev", "eu").into_sandbox())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn state_column_is_checked() {
        let (pool, _dir) = pool().await;
        let result = sqlx::query(
            "INSERT INTO sandboxes (id, organization_id, name, state, desired_state, data)
             VALUES ('x', 'org', 'n', 'paused', 'started', '{}')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pages_by_id() {
        let (pool, _dir) = pool().await;
        let store = SqliteSandboxStore::with_pool(pool);
        for i in 0..5 {
            store
                .insert(&NewSandbox::new("org", format!("sb-{i}"), "eu").into_sandbox())
                .await
                .unwrap();
        }
        let first = store.list_page(None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = store
            .list_page(Some(&first[2].id), 3)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|s| s.id > first[2].id));
    }

    #[tokio::test]
    async fn warm_pools_upsert() {
        let (pool, _dir) = pool().await;
        let store = SqliteWarmPoolStore::with_pool(pool);
        let mut wp = WarmPool::new(&NewSandbox::new("org", "t", "eu"), 2);
        store.upsert_pool(&wp).await.unwrap();
        wp.size = 5;
        store.upsert_pool(&wp).await.unwrap();
        let pools = store.list_pools_for("org").await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].size, 5);
        store.delete_pool(&wp.id).await.unwrap();
        assert!(store.get_pool(&wp.id).await.unwrap().is_none());
    }
}
