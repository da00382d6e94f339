//! SQLite-backed job store.
//!
//! The immutable part of a job lives in the JSON `data` column; status,
//! attempt and timestamps are columns so that claims and transitions are
//! single conditional statements.

use {
    async_trait::async_trait,
    corral_common::now_ms,
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
};

use crate::{
    Error, Result,
    store::JobStore,
    types::{Job, JobStatus, ResourceKind},
};

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a store on an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn transition(
        &self,
        id: &str,
        sql: &str,
        binds: (&str, Option<&str>, u64),
        expected: &'static str,
    ) -> Result<Job> {
        let (status, error, run_after_ms) = binds;
        let now = now_ms();
        let row = sqlx::query(sql)
            .bind(status)
            .bind(error)
            .bind(run_after_ms as i64)
            .bind(now as i64)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => match self.get(id).await? {
                Some(job) => Err(Error::InvalidStatus {
                    job_id: id.to_string(),
                    status: job.status.to_string(),
                    expected,
                }),
                None => Err(Error::not_found(id)),
            },
        }
    }
}

const COLUMNS: &str = "data, status, attempt, run_after_ms, error_message, started_at_ms, \
                       finished_at_ms, updated_at_ms";

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let data: String = row.get("data");
    let mut job: Job = serde_json::from_str(&data)?;
    let status: String = row.get("status");
    job.status = status.parse().map_err(Error::message)?;
    job.attempt = row.get::<i64, _>("attempt") as u32;
    job.run_after_ms = row.get::<i64, _>("run_after_ms") as u64;
    job.error_message = row.get("error_message");
    job.started_at_ms = row
        .get::<Option<i64>, _>("started_at_ms")
        .map(|v| v as u64);
    job.finished_at_ms = row
        .get::<Option<i64>, _>("finished_at_ms")
        .map(|v| v as u64);
    job.updated_at_ms = row.get::<i64, _>("updated_at_ms") as u64;
    Ok(job)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        let result = sqlx::query(
            "INSERT INTO jobs (id, type, status, resource_kind, resource_id, attempt,
                               run_after_ms, error_message, created_at_ms, updated_at_ms, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.resource_kind.as_str())
        .bind(&job.resource_id)
        .bind(i64::from(job.attempt))
        .bind(job.run_after_ms as i64)
        .bind(&job.error_message)
        .bind(job.created_at_ms as i64)
        .bind(job.updated_at_ms as i64)
        .bind(&data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let active = self
                    .active_for_resource(job.resource_kind, &job.resource_id)
                    .await?;
                Err(Error::active_job_exists(
                    job.resource_key(),
                    active.map(|j| j.id).unwrap_or_else(|| job.id.clone()),
                ))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_next(&self, now_ms: u64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "UPDATE jobs SET status = 'in_progress', started_at_ms = ?1, updated_at_ms = ?1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending' AND run_after_ms <= ?1
                 ORDER BY run_after_ms, created_at_ms, id
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {COLUMNS}"
        ))
        .bind(now_ms as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn retry(&self, id: &str, error: &str, run_after_ms: u64) -> Result<Job> {
        self.transition(
            id,
            &format!(
                "UPDATE jobs SET status = ?1, error_message = ?2, run_after_ms = ?3,
                                 attempt = attempt + 1, updated_at_ms = ?4
                 WHERE id = ?5 AND status = 'in_progress'
                 RETURNING {COLUMNS}"
            ),
            (JobStatus::Pending.as_str(), Some(error), run_after_ms),
            "in_progress",
        )
        .await
    }

    async fn complete(&self, id: &str) -> Result<Job> {
        self.transition(
            id,
            &format!(
                "UPDATE jobs SET status = ?1, error_message = ?2, finished_at_ms = ?4,
                                 updated_at_ms = ?4
                 WHERE id = ?5 AND status = 'in_progress'
                 RETURNING {COLUMNS}"
            ),
            (JobStatus::Done.as_str(), None, 0),
            "in_progress",
        )
        .await
    }

    async fn fail(&self, id: &str, error: &str) -> Result<Job> {
        self.transition(
            id,
            &format!(
                "UPDATE jobs SET status = ?1, error_message = ?2, finished_at_ms = ?4,
                                 updated_at_ms = ?4
                 WHERE id = ?5 AND status IN ('pending', 'in_progress')
                 RETURNING {COLUMNS}"
            ),
            (JobStatus::Failed.as_str(), Some(error), 0),
            "pending or in_progress",
        )
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn active_for_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE resource_kind = ? AND resource_id = ? AND status IN ('pending', 'in_progress')
             LIMIT 1"
        ))
        .bind(kind.as_str())
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_for_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE resource_kind = ? AND resource_id = ?
             ORDER BY created_at_ms, id"
        ))
        .bind(kind.as_str())
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = ? ORDER BY created_at_ms, id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_stale(&self, updated_before_ms: u64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = 'in_progress' AND updated_at_ms < ?
             ORDER BY created_at_ms, id"
        ))
        .bind(updated_before_ms as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::JobType,
        sqlx::sqlite::SqlitePoolOptions,
        std::{collections::HashSet, sync::Arc},
    };

    async fn store() -> (SqliteJobStore, SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();
        (SqliteJobStore::with_pool(pool.clone()), pool, dir)
    }

    #[tokio::test]
    async fn active_job_is_unique_per_resource() {
        let (store, _pool, _dir) = store().await;
        let first = Job::new(JobType::StartSandbox, "sb-1");
        store.enqueue(&first).await.unwrap();

        match store.enqueue(&Job::new(JobType::DestroySandbox, "sb-1")).await {
            Err(Error::ActiveJobExists { job_id, .. }) => assert_eq!(job_id, first.id),
            other => panic!("expected conflict, got {other:?}"),
        }

        store.claim_next(now_ms()).await.unwrap().unwrap();
        store.complete(&first.id).await.unwrap();
        store
            .enqueue(&Job::new(JobType::DestroySandbox, "sb-1"))
            .await
            .unwrap();
        assert_eq!(
            store
                .list_for_resource(ResourceKind::Sandbox, "sb-1")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_by_the_table() {
        let (_store, pool, _dir) = store().await;
        let result = sqlx::query(
            "INSERT INTO jobs (id, type, status, resource_kind, resource_id, created_at_ms,
                               updated_at_ms, data)
             VALUES ('x', 'RUN_ARBITRARY_CODE', 'pending', 'sandbox', 'sb', 0, 0, '{}')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let (store, _pool, _dir) = store().await;
        for i in 0..12 {
            store
                .enqueue(&Job::new(JobType::StartSandbox, format!("sb-{i}")))
                .await
                .unwrap();
        }
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(now_ms()).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn retry_defers_and_counts() {
        let (store, _pool, _dir) = store().await;
        let job = Job::new(JobType::StopSandbox, "sb").on_runner("r1");
        store.enqueue(&job).await.unwrap();
        store.claim_next(now_ms()).await.unwrap().unwrap();

        let later = now_ms() + 60_000;
        let retried = store.retry(&job.id, "status code 502", later).await.unwrap();
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.runner_id.as_deref(), Some("r1"));
        assert!(store.claim_next(now_ms()).await.unwrap().is_none());
        assert!(store.claim_next(later).await.unwrap().is_some());

        let failed = store.fail(&job.id, "gave up").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("gave up"));
        assert!(matches!(
            store.fail(&job.id, "again").await,
            Err(Error::InvalidStatus { .. })
        ));
        assert!(matches!(
            store.complete("missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
