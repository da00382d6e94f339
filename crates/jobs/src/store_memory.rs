//! In-memory job store, for tests and single-process use.

use std::{collections::HashMap, sync::Mutex};

use {async_trait::async_trait, corral_common::now_ms};

use crate::{
    Error, Result,
    store::JobStore,
    types::{Job, JobStatus, ResourceKind},
};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Job>) -> R) -> R {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut jobs)
    }

    fn transition(
        &self,
        id: &str,
        allowed: &[JobStatus],
        expected: &'static str,
        f: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        self.with(|jobs| {
            let job = jobs.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            if !allowed.contains(&job.status) {
                return Err(Error::InvalidStatus {
                    job_id: id.to_string(),
                    status: job.status.to_string(),
                    expected,
                });
            }
            f(job);
            job.updated_at_ms = now_ms();
            Ok(job.clone())
        })
    }
}

fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    jobs
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        self.with(|jobs| {
            if let Some(active) = jobs.values().find(|j| {
                !j.status.is_terminal()
                    && j.resource_kind == job.resource_kind
                    && j.resource_id == job.resource_id
            }) {
                return Err(Error::active_job_exists(job.resource_key(), &active.id));
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(())
        })
    }

    async fn claim_next(&self, now_ms: u64) -> Result<Option<Job>> {
        Ok(self.with(|jobs| {
            let id = jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending && j.run_after_ms <= now_ms)
                .min_by(|a, b| {
                    a.run_after_ms
                        .cmp(&b.run_after_ms)
                        .then_with(|| a.created_at_ms.cmp(&b.created_at_ms))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|j| j.id.clone())?;
            let job = jobs.get_mut(&id)?;
            job.status = JobStatus::InProgress;
            job.started_at_ms = Some(now_ms);
            job.updated_at_ms = now_ms;
            Some(job.clone())
        }))
    }

    async fn retry(&self, id: &str, error: &str, run_after_ms: u64) -> Result<Job> {
        self.transition(id, &[JobStatus::InProgress], "in_progress", |job| {
            job.status = JobStatus::Pending;
            job.attempt += 1;
            job.run_after_ms = run_after_ms;
            job.error_message = Some(error.to_string());
        })
    }

    async fn complete(&self, id: &str) -> Result<Job> {
        self.transition(id, &[JobStatus::InProgress], "in_progress", |job| {
            job.status = JobStatus::Done;
            job.error_message = None;
            job.finished_at_ms = Some(now_ms());
        })
    }

    async fn fail(&self, id: &str, error: &str) -> Result<Job> {
        self.transition(
            id,
            &[JobStatus::Pending, JobStatus::InProgress],
            "pending or in_progress",
            |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(error.to_string());
                job.finished_at_ms = Some(now_ms());
            },
        )
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.with(|jobs| jobs.get(id).cloned()))
    }

    async fn active_for_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<Job>> {
        Ok(self.with(|jobs| {
            jobs.values()
                .find(|j| {
                    !j.status.is_terminal()
                        && j.resource_kind == kind
                        && j.resource_id == resource_id
                })
                .cloned()
        }))
    }

    async fn list_for_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Vec<Job>> {
        Ok(sorted(self.with(|jobs| {
            jobs.values()
                .filter(|j| j.resource_kind == kind && j.resource_id == resource_id)
                .cloned()
                .collect()
        })))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        Ok(sorted(self.with(|jobs| {
            jobs.values().filter(|j| j.status == status).cloned().collect()
        })))
    }

    async fn list_stale(&self, updated_before_ms: u64) -> Result<Vec<Job>> {
        Ok(sorted(self.with(|jobs| {
            jobs.values()
                .filter(|j| {
                    j.status == JobStatus::InProgress && j.updated_at_ms < updated_before_ms
                })
                .cloned()
                .collect()
        })))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::types::JobType, std::sync::Arc};

    #[tokio::test]
    async fn one_active_job_per_resource() {
        let store = InMemoryJobStore::new();
        let first = Job::new(JobType::StartSandbox, "sb-1");
        store.enqueue(&first).await.unwrap();

        let err = store
            .enqueue(&Job::new(JobType::StopSandbox, "sb-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActiveJobExists { .. }));

        // A snapshot with the same id is a different resource.
        store
            .enqueue(&Job::new(JobType::BuildSnapshot, "sb-1"))
            .await
            .unwrap();

        let active = store
            .active_for_resource(ResourceKind::Sandbox, "sb-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, first.id);

        store.fail(&first.id, "cancelled").await.unwrap();
        store
            .enqueue(&Job::new(JobType::StopSandbox, "sb-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_respects_run_after_and_order() {
        let store = InMemoryJobStore::new();
        let mut later = Job::new(JobType::StartSandbox, "a");
        later.run_after_ms = now_ms() + 60_000;
        let mut older = Job::new(JobType::StartSandbox, "b");
        older.created_at_ms -= 10;
        let newer = Job::new(JobType::StartSandbox, "c");
        for j in [&later, &older, &newer] {
            store.enqueue(j).await.unwrap();
        }

        let now = now_ms();
        assert_eq!(store.claim_next(now).await.unwrap().unwrap().id, older.id);
        assert_eq!(store.claim_next(now).await.unwrap().unwrap().id, newer.id);
        assert!(store.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_job_once() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..20 {
            store
                .enqueue(&Job::new(JobType::StartSandbox, format!("sb-{i}")))
                .await
                .unwrap();
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(now_ms()).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn retry_then_complete() {
        let store = InMemoryJobStore::new();
        let job = Job::new(JobType::StopSandbox, "sb");
        store.enqueue(&job).await.unwrap();
        store.claim_next(now_ms()).await.unwrap();

        let retried = store.retry(&job.id, "status code 502", 0).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempt, 1);

        assert!(matches!(
            store.complete(&job.id).await,
            Err(Error::InvalidStatus { .. })
        ));
        store.claim_next(now_ms()).await.unwrap();
        let done = store.complete(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert!(
            store
                .active_for_resource(ResourceKind::Sandbox, "sb")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn stale_jobs_are_listed() {
        let store = InMemoryJobStore::new();
        let job = Job::new(JobType::BuildSnapshot, "snap");
        store.enqueue(&job).await.unwrap();
        store.claim_next(now_ms()).await.unwrap();
        assert!(store.list_stale(now_ms() - 60_000).await.unwrap().is_empty());
        assert_eq!(store.list_stale(now_ms() + 1).await.unwrap().len(), 1);
    }
}
