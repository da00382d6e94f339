//! Persistence for jobs.

use async_trait::async_trait;

use crate::{
    Result,
    types::{Job, JobStatus, ResourceKind},
};

/// Job table.
///
/// The store enforces one non-terminal job per resource: `enqueue` refuses a
/// second one with [`crate::Error::ActiveJobExists`]. Status changes are
/// conditional on the current status so a job is claimed once and finished
/// once.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<()>;

    /// Move the oldest runnable pending job to `in_progress` and return it.
    async fn claim_next(&self, now_ms: u64) -> Result<Option<Job>>;

    /// Put an in-progress job back to pending, not runnable before `run_after_ms`.
    async fn retry(&self, id: &str, error: &str, run_after_ms: u64) -> Result<Job>;

    /// Mark an in-progress job done.
    async fn complete(&self, id: &str) -> Result<Job>;

    /// Mark a pending or in-progress job failed.
    async fn fail(&self, id: &str, error: &str) -> Result<Job>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    async fn active_for_resource(&self, kind: ResourceKind, resource_id: &str)
    -> Result<Option<Job>>;

    /// All jobs for a resource, oldest first.
    async fn list_for_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Vec<Job>>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// In-progress jobs not updated since `updated_before_ms`.
    async fn list_stale(&self, updated_before_ms: u64) -> Result<Vec<Job>>;
}
