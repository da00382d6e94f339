//! SQLite-backed lease table, shared by every process pointed at the same database.

use std::time::Duration;

use {
    async_trait::async_trait,
    sqlx::SqlitePool,
};

use crate::{Result, lock::LockProvider, time::now_ms};

/// Leases stored in the `locks` table.
pub struct SqliteLocks {
    pool: SqlitePool,
}

impl SqliteLocks {
    /// Create a provider on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockProvider for SqliteLocks {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms() as i64;
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let result = sqlx::query(
            "INSERT INTO locks (key, token, expires_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at_ms = excluded.expires_at_ms
             WHERE locks.expires_at_ms <= ? OR locks.token = excluded.token",
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, sqlx::sqlite::SqlitePoolOptions};

    async fn locks() -> (SqliteLocks, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("locks.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();
        (SqliteLocks::with_pool(pool), dir)
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let (locks, _dir) = locks().await;
        assert!(locks.try_lock("sandbox:a:state-change", "t1", Duration::from_secs(30)).await.unwrap());
        assert!(!locks.try_lock("sandbox:a:state-change", "t2", Duration::from_secs(30)).await.unwrap());
        locks.unlock("sandbox:a:state-change", "t1").await.unwrap();
        assert!(locks.try_lock("sandbox:a:state-change", "t2", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let (locks, _dir) = locks().await;
        assert!(locks.try_lock("k", "t1", Duration::from_millis(0)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(locks.try_lock("k", "t2", Duration::from_secs(30)).await.unwrap());
    }
}
