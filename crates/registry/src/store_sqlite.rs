//! SQLite-backed registry store.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
};

use {
    crate::{
        Error, Result,
        store::RegistryStore,
        types::{PenaltyRule, Region, Runner},
    },
    corral_common::Resources,
};

/// Runner rows keep the JSON document in `data` and the counters in columns;
/// reads overlay the columns onto the document.
pub struct SqliteRegistryStore {
    pool: SqlitePool,
}

impl SqliteRegistryStore {
    /// Create a store on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const RUNNER_COLUMNS: &str = "data, allocated_cpu, allocated_memory_gib, allocated_disk_gib, \
                              allocated_gpu, action_load_points, action_load_penalty";

fn runner_from_row(row: &SqliteRow) -> Result<Runner> {
    let data: String = row.get("data");
    let mut runner: Runner = serde_json::from_str(&data)?;
    runner.allocated = Resources {
        cpu: row.get::<i64, _>("allocated_cpu") as u32,
        memory_gib: row.get::<i64, _>("allocated_memory_gib") as u32,
        disk_gib: row.get::<i64, _>("allocated_disk_gib") as u32,
        gpu: row.get::<i64, _>("allocated_gpu") as u32,
        gpu_type: runner.capacity.gpu_type.clone(),
    };
    runner.action_load_points = row.get::<i64, _>("action_load_points") as u32;
    runner.action_load_penalty = row.get::<i64, _>("action_load_penalty") as u32;
    Ok(runner)
}

#[async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn upsert_region(&self, region: &Region) -> Result<()> {
        let data = serde_json::to_string(region)?;
        sqlx::query(
            "INSERT INTO regions (id, data) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        )
        .bind(&region.id)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_region(&self, id: &str) -> Result<Option<Region>> {
        let row = sqlx::query("SELECT data FROM regions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Ok(serde_json::from_str(&r.get::<String, _>("data"))?))
            .transpose()
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        let rows = sqlx::query("SELECT data FROM regions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("data"))?))
            .collect()
    }

    async fn insert_runner(&self, runner: &Runner) -> Result<()> {
        let data = serde_json::to_string(runner)?;
        let result = sqlx::query(
            "INSERT INTO runners (id, region, data, capacity_cpu, capacity_memory_gib,
                                  capacity_disk_gib, capacity_gpu)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&runner.id)
        .bind(&runner.region)
        .bind(&data)
        .bind(i64::from(runner.capacity.cpu))
        .bind(i64::from(runner.capacity.memory_gib))
        .bind(i64::from(runner.capacity.disk_gib))
        .bind(i64::from(runner.capacity.gpu))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::conflict(format!("runner {} already exists", runner.id)));
        }
        Ok(())
    }

    async fn update_runner(&self, runner: &Runner) -> Result<()> {
        let data = serde_json::to_string(runner)?;
        let result = sqlx::query(
            "UPDATE runners SET region = ?, data = ?, capacity_cpu = ?, capacity_memory_gib = ?,
                                capacity_disk_gib = ?, capacity_gpu = ?
             WHERE id = ?",
        )
        .bind(&runner.region)
        .bind(&data)
        .bind(i64::from(runner.capacity.cpu))
        .bind(i64::from(runner.capacity.memory_gib))
        .bind(i64::from(runner.capacity.disk_gib))
        .bind(i64::from(runner.capacity.gpu))
        .bind(&runner.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::runner_not_found(&runner.id));
        }
        Ok(())
    }

    async fn get_runner(&self, id: &str) -> Result<Option<Runner>> {
        let row = sqlx::query(&format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(runner_from_row).transpose()
    }

    async fn list_runners(&self) -> Result<Vec<Runner>> {
        let rows = sqlx::query(&format!("SELECT {RUNNER_COLUMNS} FROM runners ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(runner_from_row).collect()
    }

    async fn delete_runner(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM runners WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::runner_not_found(id));
        }
        Ok(())
    }

    async fn try_reserve(&self, runner_id: &str, amount: &Resources) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runners SET
                allocated_cpu        = allocated_cpu + ?1,
                allocated_memory_gib = allocated_memory_gib + ?2,
                allocated_disk_gib   = allocated_disk_gib + ?3,
                allocated_gpu        = allocated_gpu + ?4
             WHERE id = ?5
               AND allocated_cpu + ?1        <= capacity_cpu
               AND allocated_memory_gib + ?2 <= capacity_memory_gib
               AND allocated_disk_gib + ?3   <= capacity_disk_gib
               AND allocated_gpu + ?4        <= capacity_gpu",
        )
        .bind(i64::from(amount.cpu))
        .bind(i64::from(amount.memory_gib))
        .bind(i64::from(amount.disk_gib))
        .bind(i64::from(amount.gpu))
        .bind(runner_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_runner(runner_id).await?.is_none() {
            return Err(Error::runner_not_found(runner_id));
        }
        Ok(false)
    }

    async fn release(&self, runner_id: &str, amount: &Resources) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runners SET
                allocated_cpu        = MAX(allocated_cpu - ?1, 0),
                allocated_memory_gib = MAX(allocated_memory_gib - ?2, 0),
                allocated_disk_gib   = MAX(allocated_disk_gib - ?3, 0),
                allocated_gpu        = MAX(allocated_gpu - ?4, 0)
             WHERE id = ?5",
        )
        .bind(i64::from(amount.cpu))
        .bind(i64::from(amount.memory_gib))
        .bind(i64::from(amount.disk_gib))
        .bind(i64::from(amount.gpu))
        .bind(runner_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::runner_not_found(runner_id));
        }
        Ok(())
    }

    async fn reset_allocated(
        &self,
        runner_id: &str,
        observed: &Resources,
        allocated: &Resources,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runners SET
                allocated_cpu        = ?1,
                allocated_memory_gib = ?2,
                allocated_disk_gib   = ?3,
                allocated_gpu        = ?4
             WHERE id = ?5
               AND allocated_cpu        = ?6
               AND allocated_memory_gib = ?7
               AND allocated_disk_gib   = ?8
               AND allocated_gpu        = ?9",
        )
        .bind(i64::from(allocated.cpu))
        .bind(i64::from(allocated.memory_gib))
        .bind(i64::from(allocated.disk_gib))
        .bind(i64::from(allocated.gpu))
        .bind(runner_id)
        .bind(i64::from(observed.cpu))
        .bind(i64::from(observed.memory_gib))
        .bind(i64::from(observed.disk_gib))
        .bind(i64::from(observed.gpu))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_runner(runner_id).await?.is_none() {
            return Err(Error::runner_not_found(runner_id));
        }
        Ok(false)
    }

    async fn adjust_action_load(
        &self,
        runner_id: &str,
        delta: i64,
        rule: PenaltyRule,
    ) -> Result<(u32, u32)> {
        let divisor = i64::from(rule.divisor.max(1));
        let row = sqlx::query(
            "UPDATE runners SET
                action_load_points  = MAX(action_load_points + ?1, 0),
                action_load_penalty = MIN(MAX(action_load_points + ?1, 0) / ?2, ?3)
             WHERE id = ?4
             RETURNING action_load_points, action_load_penalty",
        )
        .bind(delta)
        .bind(divisor)
        .bind(i64::from(rule.maximum))
        .bind(runner_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::runner_not_found(runner_id))?;
        Ok((
            row.get::<i64, _>("action_load_points") as u32,
            row.get::<i64, _>("action_load_penalty") as u32,
        ))
    }
}
