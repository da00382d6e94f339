//! SQLite-backed disk and snapshot stores.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool},
};

use crate::{
    Error, Result,
    disk::Disk,
    snapshot::{Snapshot, SnapshotState},
    store::{DiskStore, SnapshotStore},
};

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn decode<T: serde::de::DeserializeOwned>(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<T>> {
    rows.iter()
        .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("data"))?))
        .collect()
}

pub struct SqliteDiskStore {
    pool: SqlitePool,
}

impl SqliteDiskStore {
    /// Create a store on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiskStore for SqliteDiskStore {
    async fn insert(&self, disk: &Disk) -> Result<()> {
        let data = serde_json::to_string(disk)?;
        sqlx::query(
            "INSERT INTO disks (id, organization_id, name, state, sandbox_id, data)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&disk.id)
        .bind(&disk.organization_id)
        .bind(&disk.name)
        .bind(disk.state.as_str())
        .bind(&disk.sandbox_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::conflict(format!("disk with name {} already exists", disk.name))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update(&self, disk: &Disk) -> Result<()> {
        let data = serde_json::to_string(disk)?;
        let result = sqlx::query(
            "UPDATE disks SET name = ?, state = ?, sandbox_id = ?, data = ? WHERE id = ?",
        )
        .bind(&disk.name)
        .bind(disk.state.as_str())
        .bind(&disk.sandbox_id)
        .bind(&data)
        .bind(&disk.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::DiskNotFound(disk.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Disk>> {
        let rows = sqlx::query("SELECT data FROM disks WHERE id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn list(&self, organization_id: &str) -> Result<Vec<Disk>> {
        let rows = sqlx::query(
            "SELECT data FROM disks WHERE organization_id = ? AND state != 'deleted' ORDER BY rowid",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        decode(&rows)
    }

    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Disk>> {
        let rows = sqlx::query(
            "SELECT data FROM disks WHERE organization_id = ? AND name = ? AND state != 'deleted'",
        )
        .bind(organization_id)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn list_attached_to(&self, sandbox_id: &str) -> Result<Vec<Disk>> {
        let rows = sqlx::query("SELECT data FROM disks WHERE sandbox_id = ? ORDER BY rowid")
            .bind(sandbox_id)
            .fetch_all(&self.pool)
            .await?;
        decode(&rows)
    }
}

pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Create a store on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        sqlx::query(
            "INSERT INTO snapshots (id, organization_id, name, state, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.organization_id)
        .bind(&snapshot.name)
        .bind(snapshot.state.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::conflict(format!("snapshot with name {} already exists", snapshot.name))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update(&self, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        let result = sqlx::query("UPDATE snapshots SET state = ?, data = ? WHERE id = ?")
            .bind(snapshot.state.as_str())
            .bind(&data)
            .bind(&snapshot.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SnapshotNotFound(snapshot.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        let rows = sqlx::query("SELECT data FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Snapshot>> {
        let rows = sqlx::query("SELECT data FROM snapshots WHERE organization_id = ? AND name = ?")
            .bind(organization_id)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode(&rows)?.pop())
    }

    async fn list(&self, organization_id: &str) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query("SELECT data FROM snapshots WHERE organization_id = ? ORDER BY rowid")
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        decode(&rows)
    }

    async fn list_in_states(&self, states: &[SnapshotState]) -> Result<Vec<Snapshot>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!("SELECT data FROM snapshots WHERE state IN ({placeholders}) ORDER BY rowid");
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        decode(&rows)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SnapshotNotFound(id.to_string()));
        }
        Ok(())
    }
}
