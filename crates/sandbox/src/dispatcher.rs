//! The job dispatcher.
//!
//! Workers claim pending jobs atomically, run them through the handler that
//! owns the job's resource under an operation-specific timeout, and route
//! failures through the classifier: transient failures are re-queued with
//! backoff, everything else ends the job and is handed to
//! [`JobHandler::finish`] exactly once.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    corral_common::{Tick, now_ms},
    corral_config::{CorralConfig, DispatcherConfig},
    corral_jobs::{
        Classification, Job, JobError, JobHandler, JobOutcome, JobStore, JobType, classify_sanitized,
    },
    corral_registry::{ActionLoad, LoadAction, RegistryStore},
    tracing::{debug, info, warn},
};

use crate::Result;

/// Action-load weight a job puts on its runner while it runs.
fn load_action(job: &Job) -> Option<LoadAction> {
    match job.job_type {
        JobType::DestroySandbox => Some(LoadAction::Destroy),
        JobType::StopSandbox => Some(LoadAction::Stop),
        JobType::BuildSnapshot => Some(LoadAction::BuildSnapshot),
        JobType::PullSnapshot => Some(LoadAction::PullSnapshot),
        JobType::StartSandbox => Some(LoadAction::StartFromStopped),
        JobType::CreateSandbox
            if job
                .payload
                .get("restoreFrom")
                .is_some_and(|v| !v.is_null()) =>
        {
            Some(LoadAction::Restore)
        },
        JobType::CreateSandbox
        | JobType::RecoverSandbox
        | JobType::ForkSandbox
        | JobType::CloneSandbox => Some(LoadAction::Start),
        JobType::CreateBackup
        | JobType::RemoveSnapshot
        | JobType::UpdateSandboxNetworkSettings
        | JobType::CreateSandboxSnapshot
        | JobType::ResizeSandbox => None,
    }
}

pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    sandboxes: Arc<dyn JobHandler>,
    snapshots: Arc<dyn JobHandler>,
    action_load: ActionLoad,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        sandboxes: Arc<dyn JobHandler>,
        snapshots: Arc<dyn JobHandler>,
        registry: Arc<dyn RegistryStore>,
        config: &CorralConfig,
    ) -> Self {
        Self {
            jobs,
            sandboxes,
            snapshots,
            action_load: ActionLoad::new(registry, config.allocator.action_load.clone()),
            config: config.dispatcher.clone(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn handler_for(&self, job_type: JobType) -> &Arc<dyn JobHandler> {
        match job_type {
            JobType::CreateSandbox
            | JobType::StartSandbox
            | JobType::StopSandbox
            | JobType::DestroySandbox
            | JobType::CreateBackup
            | JobType::UpdateSandboxNetworkSettings
            | JobType::CreateSandboxSnapshot
            | JobType::ForkSandbox
            | JobType::CloneSandbox
            | JobType::ResizeSandbox
            | JobType::RecoverSandbox => &self.sandboxes,
            JobType::BuildSnapshot | JobType::PullSnapshot | JobType::RemoveSnapshot => {
                &self.snapshots
            },
        }
    }

    fn timeout_for(&self, job_type: JobType) -> Duration {
        let t = &self.config.timeouts;
        let secs = match job_type {
            JobType::BuildSnapshot => t.build_snapshot_secs,
            JobType::PullSnapshot => t.pull_snapshot_secs,
            JobType::CreateBackup => t.create_backup_secs,
            JobType::CreateSandboxSnapshot => t.create_sandbox_snapshot_secs,
            _ => t.default_secs,
        };
        Duration::from_secs(secs)
    }

    /// Claim and run one job. Returns `false` when nothing was runnable.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.jobs.claim_next(now_ms()).await? else {
            return Ok(false);
        };
        debug!(job_id = %job.id, job_type = %job.job_type, resource = %job.resource_key(), attempt = job.attempt, "job claimed");

        let load = load_action(&job).zip(job.runner_id.clone());
        if let Some((action, runner_id)) = &load
            && let Err(e) = self.action_load.begin(runner_id, *action).await
        {
            warn!(runner_id = %runner_id, error = %e, "failed to charge action load");
        }

        let handler = self.handler_for(job.job_type);
        let timeout = self.timeout_for(job.job_type);
        let result = match tokio::time::timeout(timeout, handler.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout(timeout.as_secs())),
        };

        if let Some((action, runner_id)) = &load
            && let Err(e) = self.action_load.finish(runner_id, *action).await
        {
            warn!(runner_id = %runner_id, error = %e, "failed to refund action load");
        }

        match result {
            Ok(()) => {
                let done = self.jobs.complete(&job.id).await?;
                info!(job_id = %done.id, job_type = %done.job_type, resource = %done.resource_key(), "job done");
                self.finish(handler, &done, &JobOutcome::Succeeded).await;
            },
            Err(e) => {
                let error = e.sanitize();
                let classification = classify_sanitized(job.job_type.operation_kind(), &error);
                let attempt = job.attempt + 1;
                if classification == Classification::RetryTransient
                    && attempt <= self.config.max_transient_retries
                {
                    let delay_ms = self.config.backoff_ms(attempt);
                    self.jobs
                        .retry(
                            &job.id,
                            &error.error_reason,
                            now_ms().saturating_add(delay_ms),
                        )
                        .await?;
                    info!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt,
                        delay_ms,
                        reason = %error.error_reason,
                        "transient failure, job re-queued"
                    );
                } else {
                    let failed = self.jobs.fail(&job.id, &error.error_reason).await?;
                    self.finish(handler, &failed, &JobOutcome::Failed {
                        error,
                        classification,
                    })
                    .await;
                }
            },
        }
        Ok(true)
    }

    async fn finish(&self, handler: &Arc<dyn JobHandler>, job: &Job, outcome: &JobOutcome) {
        if let Err(e) = handler.finish(job, outcome).await {
            warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "failed to apply job result");
        }
    }

    /// Fail in-progress jobs whose worker is gone, e.g. because the process
    /// that claimed them died. A job is stale once its own execution timeout
    /// plus the `stale_job_secs` grace has passed since it was claimed.
    pub async fn fail_stale(&self) -> Result<usize> {
        self.fail_stale_at(now_ms()).await
    }

    /// Seconds a job of `job_type` may stay in progress before it is reaped.
    fn stale_after_secs(&self, job_type: JobType) -> u64 {
        self.timeout_for(job_type)
            .as_secs()
            .saturating_add(self.config.stale_job_secs)
    }

    pub async fn fail_stale_at(&self, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(self.config.stale_job_secs.saturating_mul(1_000));
        let candidates = self.jobs.list_stale(cutoff).await?;
        let mut count = 0;
        for job in candidates {
            let allowed = self.stale_after_secs(job.job_type);
            let started = job.started_at_ms.unwrap_or(job.updated_at_ms);
            if started.saturating_add(allowed.saturating_mul(1_000)) >= now {
                continue;
            }
            let message = format!("job made no progress within {allowed}s");
            let failed = match self.jobs.fail(&job.id, &message).await {
                Ok(failed) => failed,
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "stale job already moved on");
                    continue;
                },
            };
            count += 1;
            warn!(job_id = %job.id, job_type = %job.job_type, "stale job failed");
            let error = JobError::message(message).sanitize();
            let classification = classify_sanitized(job.job_type.operation_kind(), &error);
            self.finish(self.handler_for(job.job_type), &failed, &JobOutcome::Failed {
                error,
                classification,
            })
            .await;
        }
        Ok(count)
    }
}

/// One dispatcher worker: drains runnable jobs on every tick.
pub struct DispatchWorker {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchWorker {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Tick for DispatchWorker {
    fn name(&self) -> &'static str {
        "job-worker"
    }

    async fn tick(&self) {
        loop {
            match self.dispatcher.run_once().await {
                Ok(true) => {},
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "job worker iteration failed");
                    break;
                },
            }
        }
    }
}

pub struct StaleJobReaper {
    dispatcher: Arc<Dispatcher>,
}

impl StaleJobReaper {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Tick for StaleJobReaper {
    fn name(&self) -> &'static str {
        "stale-jobs"
    }

    async fn tick(&self) {
        match self.dispatcher.fail_stale().await {
            Ok(0) => {},
            Ok(failed) => info!(failed, "stale jobs failed"),
            Err(e) => warn!(error = %e, "stale job pass failed"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        corral_jobs::{InMemoryJobStore, JobStatus},
        corral_registry::InMemoryRegistryStore,
        std::sync::Mutex,
    };

    /// Fails with a scripted message a fixed number of times, then succeeds.
    #[derive(Default)]
    struct Flaky {
        failures: Mutex<Vec<String>>,
        outcomes: Mutex<Vec<JobOutcome>>,
    }

    impl Flaky {
        fn failing(messages: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(messages.iter().rev().map(|m| (*m).to_string()).collect()),
                outcomes: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn execute(&self, _job: &Job) -> std::result::Result<(), JobError> {
            match self.failures.lock().unwrap().pop() {
                Some(message) => Err(JobError::message(message)),
                None => Ok(()),
            }
        }

        async fn finish(&self, _job: &Job, outcome: &JobOutcome) -> std::result::Result<(), JobError> {
            self.outcomes.lock().unwrap().push(outcome.clone());
            Ok(())
        }
    }

    fn dispatcher(handler: Arc<Flaky>, jobs: Arc<InMemoryJobStore>) -> Dispatcher {
        let mut config = CorralConfig::default();
        config.dispatcher.backoff_base_ms = 0;
        Dispatcher::new(
            jobs,
            handler.clone(),
            handler,
            Arc::new(InMemoryRegistryStore::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let handler = Flaky::failing(&["Request failed with status code 502"; 2]);
        let d = dispatcher(handler.clone(), jobs.clone());
        let job = Job::new(JobType::StartSandbox, "sb");
        jobs.enqueue(&job).await.unwrap();

        while d.run_once().await.unwrap() {}

        let job = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt, 2);
        assert_eq!(*handler.outcomes.lock().unwrap(), vec![JobOutcome::Succeeded]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_once() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let handler = Flaky::failing(&["Request failed with status code 502"; 10]);
        let d = dispatcher(handler.clone(), jobs.clone());
        let job = Job::new(JobType::StartSandbox, "sb");
        jobs.enqueue(&job).await.unwrap();

        while d.run_once().await.unwrap() {}

        let job = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 3);
        let outcomes = handler.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            JobOutcome::Failed {
                classification: Classification::RetryTransient,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn gateway_timeout_on_start_fails_without_retry() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let handler = Flaky::failing(&["request failed with status code 504: upstream"]);
        let d = dispatcher(handler.clone(), jobs.clone());
        let job = Job::new(JobType::StartSandbox, "sb");
        jobs.enqueue(&job).await.unwrap();

        assert!(d.run_once().await.unwrap());
        let job = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 0);
    }

    fn reaper(handler: Arc<Flaky>, jobs: Arc<InMemoryJobStore>) -> Dispatcher {
        let mut config = CorralConfig::default();
        config.dispatcher.stale_job_secs = 60;
        config.dispatcher.timeouts.default_secs = 120;
        config.dispatcher.timeouts.create_backup_secs = 1_800;
        Dispatcher::new(
            jobs,
            handler.clone(),
            handler,
            Arc::new(InMemoryRegistryStore::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn stale_jobs_reach_a_terminal_status() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let handler = Flaky::failing(&[]);
        let d = reaper(handler.clone(), jobs.clone());
        let job = Job::new(JobType::StopSandbox, "sb");
        jobs.enqueue(&job).await.unwrap();
        let claimed = jobs.claim_next(now_ms()).await.unwrap().unwrap();
        let started = claimed.started_at_ms.unwrap();

        assert_eq!(d.fail_stale_at(started + 180_000).await.unwrap(), 0);
        assert_eq!(d.fail_stale_at(started + 180_001).await.unwrap(), 1);
        let job = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("job made no progress within 180s")
        );
        assert_eq!(handler.outcomes.lock().unwrap().len(), 1);
        assert_eq!(d.fail_stale_at(started + 999_999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn long_jobs_are_not_reaped_within_their_timeout() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let handler = Flaky::failing(&[]);
        let d = reaper(handler.clone(), jobs.clone());
        let backup = Job::new(JobType::CreateBackup, "sb-1");
        jobs.enqueue(&backup).await.unwrap();
        let started = jobs
            .claim_next(now_ms())
            .await
            .unwrap()
            .unwrap()
            .started_at_ms
            .unwrap();

        // Well past the grace and the default timeout, inside the backup timeout.
        assert_eq!(d.fail_stale_at(started + 1_000_000).await.unwrap(), 0);
        assert_eq!(
            jobs.get(&backup.id).await.unwrap().unwrap().status,
            JobStatus::InProgress
        );
        assert!(handler.outcomes.lock().unwrap().is_empty());

        assert_eq!(d.fail_stale_at(started + 1_860_001).await.unwrap(), 1);
        assert_eq!(
            jobs.get(&backup.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    /// Never answers within any sane timeout.
    struct Hanging {
        outcomes: Mutex<Vec<JobOutcome>>,
    }

    #[async_trait]
    impl JobHandler for Hanging {
        async fn execute(&self, _job: &Job) -> std::result::Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn finish(&self, _job: &Job, outcome: &JobOutcome) -> std::result::Result<(), JobError> {
            self.outcomes.lock().unwrap().push(outcome.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn timed_out_job_fails_through_the_classifier() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let handler = Arc::new(Hanging {
            outcomes: Mutex::default(),
        });
        let mut config = CorralConfig::default();
        config.dispatcher.timeouts.default_secs = 1;
        let d = Dispatcher::new(
            jobs.clone(),
            handler.clone(),
            handler.clone(),
            Arc::new(InMemoryRegistryStore::new()),
            &config,
        );
        let job = Job::new(JobType::StartSandbox, "sb");
        jobs.enqueue(&job).await.unwrap();

        assert!(d.run_once().await.unwrap());

        let job = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.error_message.as_deref(), Some("timed out after 1s"));
        assert_eq!(*handler.outcomes.lock().unwrap(), vec![JobOutcome::Failed {
            error: corral_jobs::SanitizedError {
                recoverable: false,
                error_reason: "timed out after 1s".into(),
            },
            classification: Classification::Fatal,
        }]);
    }

    #[test]
    fn restores_weigh_more_than_creates() {
        let create = Job::new(JobType::CreateSandbox, "sb")
            .with_payload(serde_json::json!({ "restoreFrom": null }));
        let restore = Job::new(JobType::CreateSandbox, "sb")
            .with_payload(serde_json::json!({ "restoreFrom": "backups/sb:1" }));
        assert_eq!(load_action(&create), Some(LoadAction::Start));
        assert_eq!(load_action(&restore), Some(LoadAction::Restore));
        assert_eq!(load_action(&Job::new(JobType::CreateBackup, "sb")), None);
    }
}
