//! Snapshot pipeline.
//!
//! User operations only record intent (`build_pending`, `pending`,
//! `removing`). A periodic tick moves each in-flight snapshot one step:
//! it enqueues the build, pull or remove job on a chosen runner, or runs the
//! validation inline. Job results come back through [`JobHandler::finish`]
//! and are applied only while the snapshot is still in the state that
//! issued the job.

use std::{cmp::Reverse, sync::Arc};

use {
    async_trait::async_trait,
    corral_common::{LockProvider, Tick, acquire, now_ms, snapshot_lock_key, try_acquire},
    corral_config::{LocksConfig, SnapshotsConfig},
    corral_jobs::{Job, JobError, JobHandler, JobOutcome, JobStore, JobType, ResourceKind},
    corral_registry::{RegistryStore, Runner, RunnerState},
    corral_runner_client::{BuildSnapshotRequest, PullSnapshotRequest, RunnerApi, RunnerTarget},
    serde_json::json,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    snapshot::{DEFAULT_ENTRYPOINT, NewSnapshot, Snapshot, SnapshotState},
    store::SnapshotStore,
};

pub struct SnapshotPipeline {
    store: Arc<dyn SnapshotStore>,
    jobs: Arc<dyn JobStore>,
    registry: Arc<dyn RegistryStore>,
    api: Arc<dyn RunnerApi>,
    locks: Arc<dyn LockProvider>,
    config: SnapshotsConfig,
    lock_config: LocksConfig,
}

impl SnapshotPipeline {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        jobs: Arc<dyn JobStore>,
        registry: Arc<dyn RegistryStore>,
        api: Arc<dyn RunnerApi>,
        locks: Arc<dyn LockProvider>,
        config: SnapshotsConfig,
        lock_config: LocksConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            registry,
            api,
            locks,
            config,
            lock_config,
        }
    }

    pub async fn create(&self, request: NewSnapshot) -> Result<Snapshot> {
        if request.name.trim().is_empty() {
            return Err(Error::message("snapshot name must not be empty"));
        }
        if request.image_name.trim().is_empty() {
            return Err(Error::message("snapshot image name must not be empty"));
        }
        let snapshot = request.into_snapshot();
        self.store.insert(&snapshot).await?;
        info!(
            snapshot_id = %snapshot.id,
            name = %snapshot.name,
            state = %snapshot.state,
            "snapshot registered"
        );
        Ok(snapshot)
    }

    pub async fn get(&self, id: &str) -> Result<Snapshot> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))
    }

    pub async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Snapshot> {
        self.store
            .find_by_name(organization_id, name)
            .await?
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))
    }

    pub async fn list(&self, organization_id: &str) -> Result<Vec<Snapshot>> {
        self.store.list(organization_id).await
    }

    pub async fn activate(&self, id: &str) -> Result<Snapshot> {
        self.update_locked(id, |s| match s.state {
            SnapshotState::Inactive => {
                s.state = SnapshotState::Active;
                Ok(())
            },
            state => Err(Error::invalid_state("snapshot", &s.id, state, "activate")),
        })
        .await
    }

    /// Deactivating an inactive snapshot is a no-op.
    pub async fn deactivate(&self, id: &str) -> Result<Snapshot> {
        self.update_locked(id, |s| match s.state {
            SnapshotState::Active | SnapshotState::Inactive => {
                s.state = SnapshotState::Inactive;
                Ok(())
            },
            state => Err(Error::invalid_state("snapshot", &s.id, state, "deactivate")),
        })
        .await
    }

    /// Mark for removal; the pipeline tick does the rest.
    pub async fn remove(&self, id: &str) -> Result<Snapshot> {
        self.update_locked(id, |s| {
            s.state = SnapshotState::Removing;
            Ok(())
        })
        .await
    }

    pub async fn add_region(&self, id: &str, region: &str) -> Result<Snapshot> {
        let region = region.to_string();
        self.update_locked(id, move |s| {
            s.regions.insert(region);
            Ok(())
        })
        .await
    }

    pub async fn remove_region(&self, id: &str, region: &str) -> Result<Snapshot> {
        self.update_locked(id, |s| {
            s.regions.remove(region);
            Ok(())
        })
        .await
    }

    /// Record that a sandbox was created from this snapshot.
    pub async fn touch(&self, id: &str) -> Result<()> {
        self.update_locked(id, |s| {
            s.last_used_at_ms = Some(now_ms());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn update_locked(
        &self,
        id: &str,
        f: impl FnOnce(&mut Snapshot) -> Result<()> + Send,
    ) -> Result<Snapshot> {
        let guard = acquire(
            &self.locks,
            &snapshot_lock_key(id),
            self.lock_config.ttl(),
            self.lock_config.wait(),
        )
        .await?;
        let result = async {
            let mut snapshot = self.get(id).await?;
            f(&mut snapshot)?;
            self.save(&mut snapshot).await?;
            Ok(snapshot)
        }
        .await;
        guard.release().await?;
        result
    }

    /// Move every in-flight snapshot one step. Returns how many moved.
    pub async fn advance(&self) -> Result<usize> {
        let mut moved = 0;
        for snapshot in self.store.list_in_states(&SnapshotState::IN_PIPELINE).await? {
            let key = snapshot_lock_key(&snapshot.id);
            let Some(guard) = try_acquire(&self.locks, &key, self.lock_config.ttl()).await? else {
                debug!(snapshot_id = %snapshot.id, "snapshot busy, skipping");
                continue;
            };
            let result = self.step(&snapshot.id).await;
            guard.release().await?;
            match result {
                Ok(true) => moved += 1,
                Ok(false) => {},
                Err(e) => warn!(snapshot_id = %snapshot.id, error = %e, "snapshot step failed"),
            }
        }
        Ok(moved)
    }

    async fn step(&self, id: &str) -> Result<bool> {
        // Re-read under the lock; the listing may be stale.
        let Some(mut snapshot) = self.store.get(id).await? else {
            return Ok(false);
        };
        match snapshot.state {
            SnapshotState::BuildPending => {
                let Some(build_context) = snapshot.build_context.clone() else {
                    return self
                        .fail(&mut snapshot, SnapshotState::BuildFailed, "missing build context")
                        .await;
                };
                let payload = json!({ "snapshotRef": snapshot.image_name, "buildContext": build_context });
                self.dispatch(&mut snapshot, JobType::BuildSnapshot, SnapshotState::Building, payload)
                    .await
            },
            SnapshotState::Pending => {
                let payload = json!({ "snapshotRef": snapshot.image_name });
                self.dispatch(&mut snapshot, JobType::PullSnapshot, SnapshotState::Pulling, payload)
                    .await
            },
            SnapshotState::PendingValidation | SnapshotState::Validating => {
                snapshot.state = SnapshotState::Validating;
                self.save(&mut snapshot).await?;
                self.validate(&mut snapshot).await?;
                Ok(true)
            },
            SnapshotState::Removing => self.dispatch_remove(&mut snapshot).await,
            // Waiting on a job.
            _ => Ok(false),
        }
    }

    async fn dispatch(
        &self,
        snapshot: &mut Snapshot,
        job_type: JobType,
        next: SnapshotState,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let Some(runner) = self.pick_runner(snapshot).await? else {
            debug!(snapshot_id = %snapshot.id, %job_type, "no runner available for snapshot");
            return Ok(false);
        };
        let job = Job::new(job_type, &snapshot.id)
            .on_runner(&runner.id)
            .with_payload(payload);
        match self.jobs.enqueue(&job).await {
            Ok(()) => {},
            Err(corral_jobs::Error::ActiveJobExists { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        snapshot.state = next;
        snapshot.runner_id = Some(runner.id.clone());
        snapshot.error_reason = None;
        self.save(snapshot).await?;
        info!(snapshot_id = %snapshot.id, job_id = %job.id, %job_type, runner_id = %runner.id, "snapshot job enqueued");
        Ok(true)
    }

    async fn dispatch_remove(&self, snapshot: &mut Snapshot) -> Result<bool> {
        if self
            .jobs
            .active_for_resource(ResourceKind::Snapshot, &snapshot.id)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let Some(runner_id) = snapshot.runner_id.clone() else {
            self.store.delete(&snapshot.id).await?;
            info!(snapshot_id = %snapshot.id, "snapshot removed");
            return Ok(true);
        };
        let job = Job::new(JobType::RemoveSnapshot, &snapshot.id)
            .on_runner(&runner_id)
            .with_payload(json!({ "snapshotRef": snapshot.image_name }));
        match self.jobs.enqueue(&job).await {
            Ok(()) => Ok(true),
            Err(corral_jobs::Error::ActiveJobExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn validate(&self, snapshot: &mut Snapshot) -> Result<()> {
        let Some(runner_id) = snapshot.runner_id.clone() else {
            self.fail(snapshot, SnapshotState::Error, "no runner holds the snapshot image")
                .await?;
            return Ok(());
        };
        let target = self.target(&runner_id).await?;
        let info = match self.api.inspect_snapshot(&target, &snapshot.image_name).await {
            Ok(info) => info,
            Err(e) => {
                self.fail(snapshot, SnapshotState::Error, &e.to_string()).await?;
                return Ok(());
            },
        };
        if info.size_gib > self.config.max_size_gib {
            let reason = format!(
                "Snapshot size ({:.2}GB) exceeds maximum allowed size of {}GB",
                info.size_gib, self.config.max_size_gib
            );
            self.fail(snapshot, SnapshotState::Error, &reason).await?;
            return Ok(());
        }
        snapshot.size_gib = Some(info.size_gib);
        if snapshot.entrypoint.is_empty() {
            snapshot.entrypoint = if info.entrypoint.is_empty() {
                DEFAULT_ENTRYPOINT.iter().map(ToString::to_string).collect()
            } else {
                info.entrypoint
            };
        }
        snapshot.state = SnapshotState::Active;
        snapshot.error_reason = None;
        self.save(snapshot).await?;
        info!(snapshot_id = %snapshot.id, size_gib = info.size_gib, "snapshot active");
        Ok(())
    }

    async fn fail(&self, snapshot: &mut Snapshot, state: SnapshotState, reason: &str) -> Result<bool> {
        warn!(snapshot_id = %snapshot.id, %state, reason, "snapshot failed");
        snapshot.state = state;
        snapshot.error_reason = Some(reason.to_string());
        self.save(snapshot).await?;
        Ok(true)
    }

    /// Highest-scoring ready runner of the snapshot's class in one of its regions.
    async fn pick_runner(&self, snapshot: &Snapshot) -> Result<Option<Runner>> {
        let mut runners: Vec<Runner> = self
            .registry
            .list_runners()
            .await?
            .into_iter()
            .filter(|r| {
                r.state == RunnerState::Ready
                    && !r.draining
                    && r.class == snapshot.class
                    && snapshot.is_available_in(&r.region)
            })
            .collect();
        runners.sort_by(|a, b| {
            Reverse(a.availability_score)
                .cmp(&Reverse(b.availability_score))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(runners.into_iter().next())
    }

    async fn target(&self, runner_id: &str) -> Result<RunnerTarget> {
        let runner = self
            .registry
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| corral_registry::Error::runner_not_found(runner_id))?;
        Ok(runner.target())
    }

    async fn save(&self, snapshot: &mut Snapshot) -> Result<()> {
        snapshot.updated_at_ms = now_ms();
        self.store.update(snapshot).await
    }

    async fn apply_outcome(&self, job: &Job, outcome: &JobOutcome) -> Result<()> {
        let Some(mut snapshot) = self.store.get(&job.resource_id).await? else {
            return Ok(());
        };
        let expected = match job.job_type {
            JobType::BuildSnapshot => SnapshotState::Building,
            JobType::PullSnapshot => SnapshotState::Pulling,
            JobType::RemoveSnapshot => SnapshotState::Removing,
            other => return Err(Error::message(format!("{other} is not a snapshot job"))),
        };
        if snapshot.state != expected {
            debug!(snapshot_id = %snapshot.id, state = %snapshot.state, job_id = %job.id, "snapshot moved on, ignoring job result");
            return Ok(());
        }
        match (job.job_type, outcome) {
            (JobType::RemoveSnapshot, JobOutcome::Succeeded) => {
                self.store.delete(&snapshot.id).await?;
                info!(snapshot_id = %snapshot.id, "snapshot removed");
            },
            (JobType::BuildSnapshot, JobOutcome::Succeeded) => {
                snapshot.state = SnapshotState::Pending;
                self.save(&mut snapshot).await?;
            },
            (_, JobOutcome::Succeeded) => {
                snapshot.state = SnapshotState::PendingValidation;
                self.save(&mut snapshot).await?;
            },
            (JobType::BuildSnapshot, JobOutcome::Failed { error, .. }) => {
                self.fail(&mut snapshot, SnapshotState::BuildFailed, &error.error_reason)
                    .await?;
            },
            (_, JobOutcome::Failed { error, .. }) => {
                self.fail(&mut snapshot, SnapshotState::Error, &error.error_reason)
                    .await?;
            },
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SnapshotPipeline {
    async fn execute(&self, job: &Job) -> std::result::Result<(), JobError> {
        let runner_id = job
            .runner_id
            .as_deref()
            .ok_or_else(|| JobError::message(format!("job {} has no runner", job.id)))?;
        let snapshot = self
            .store
            .get(&job.resource_id)
            .await
            .map_err(|e| JobError::external("loading snapshot", e))?;
        let Some(snapshot) = snapshot else {
            return match job.job_type {
                JobType::RemoveSnapshot => Ok(()),
                _ => Err(JobError::message(format!("snapshot {} not found", job.resource_id))),
            };
        };
        let target = self
            .target(runner_id)
            .await
            .map_err(|e| JobError::external("resolving runner", e))?;
        match job.job_type {
            JobType::BuildSnapshot => {
                let build_context = snapshot.build_context.clone().unwrap_or_default();
                self.api
                    .build_snapshot(&target, &BuildSnapshotRequest {
                        snapshot_ref: snapshot.image_name,
                        build_context,
                    })
                    .await?;
            },
            JobType::PullSnapshot => {
                self.api
                    .pull_snapshot(&target, &PullSnapshotRequest {
                        snapshot_ref: snapshot.image_name,
                        registry: None,
                    })
                    .await?;
            },
            JobType::RemoveSnapshot => {
                self.api.remove_snapshot(&target, &snapshot.image_name).await?;
            },
            other => return Err(JobError::message(format!("{other} is not a snapshot job"))),
        }
        Ok(())
    }

    async fn finish(&self, job: &Job, outcome: &JobOutcome) -> std::result::Result<(), JobError> {
        let guard = acquire(
            &self.locks,
            &snapshot_lock_key(&job.resource_id),
            self.lock_config.ttl(),
            self.lock_config.wait(),
        )
        .await
        .map_err(|e| JobError::external("locking snapshot", e))?;
        let result = self.apply_outcome(job, outcome).await;
        guard
            .release()
            .await
            .map_err(|e| JobError::external("unlocking snapshot", e))?;
        result.map_err(|e| JobError::external("applying snapshot job result", e))
    }
}

#[async_trait]
impl Tick for SnapshotPipeline {
    fn name(&self) -> &'static str {
        "snapshot-pipeline"
    }

    async fn tick(&self) {
        match self.advance().await {
            Ok(0) => {},
            Ok(moved) => debug!(moved, "snapshot pipeline advanced"),
            Err(e) => warn!(error = %e, "snapshot pipeline tick failed"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store_memory::InMemorySnapshotStore,
        corral_common::{InMemoryLocks, Resources},
        corral_jobs::{Classification, InMemoryJobStore, JobStatus, SanitizedError},
        corral_registry::{InMemoryRegistryStore, RunnerClass},
        corral_runner_client::{ScriptedRunner, SnapshotInfo},
    };

    struct Fixture {
        pipeline: SnapshotPipeline,
        jobs: Arc<InMemoryJobStore>,
        registry: Arc<InMemoryRegistryStore>,
        api: Arc<ScriptedRunner>,
    }

    fn ready(id: &str, region: &str, score: u32) -> Runner {
        let mut r = Runner::new(id, region, RunnerClass::Linux, Resources::new(8, 16, 100));
        r.state = RunnerState::Ready;
        r.availability_score = score;
        r
    }

    async fn fixture(runners: Vec<Runner>) -> Fixture {
        let registry = Arc::new(InMemoryRegistryStore::new());
        for r in &runners {
            registry.insert_runner(r).await.unwrap();
        }
        let jobs = Arc::new(InMemoryJobStore::new());
        let api = Arc::new(ScriptedRunner::new());
        let pipeline = SnapshotPipeline::new(
            Arc::new(InMemorySnapshotStore::new()),
            jobs.clone(),
            registry.clone(),
            api.clone(),
            Arc::new(InMemoryLocks::new()),
            SnapshotsConfig::default(),
            LocksConfig::default(),
        );
        Fixture {
            pipeline,
            jobs,
            registry,
            api,
        }
    }

    /// Claim and run every due job, the way a dispatcher worker would.
    async fn drain_jobs(f: &Fixture) -> Vec<Job> {
        let mut ran = Vec::new();
        while let Some(job) = f.jobs.claim_next(now_ms()).await.unwrap() {
            let outcome = match f.pipeline.execute(&job).await {
                Ok(()) => {
                    f.jobs.complete(&job.id).await.unwrap();
                    JobOutcome::Succeeded
                },
                Err(e) => {
                    let error = e.sanitize();
                    f.jobs.fail(&job.id, &error.error_reason).await.unwrap();
                    JobOutcome::Failed {
                        error,
                        classification: Classification::Fatal,
                    }
                },
            };
            f.pipeline.finish(&job, &outcome).await.unwrap();
            ran.push(job);
        }
        ran
    }

    #[tokio::test]
    async fn pulled_snapshot_becomes_active() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "base", "ubuntu:24.04"))
            .await
            .unwrap();
        assert_eq!(s.state, SnapshotState::Pending);
        f.api.set_snapshot_info("ubuntu:24.04", SnapshotInfo {
            size_gib: 1.5,
            entrypoint: Vec::new(),
        });

        assert_eq!(f.pipeline.advance().await.unwrap(), 1);
        assert_eq!(f.pipeline.get(&s.id).await.unwrap().state, SnapshotState::Pulling);
        let ran = drain_jobs(&f).await;
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].job_type, JobType::PullSnapshot);
        assert_eq!(
            f.pipeline.get(&s.id).await.unwrap().state,
            SnapshotState::PendingValidation
        );

        f.pipeline.advance().await.unwrap();
        let s = f.pipeline.get(&s.id).await.unwrap();
        assert_eq!(s.state, SnapshotState::Active);
        assert_eq!(s.size_gib, Some(1.5));
        assert_eq!(s.entrypoint, vec!["sleep", "infinity"]);
        assert_eq!(s.runner_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn built_snapshot_goes_through_pull() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let mut request = NewSnapshot::new("org", "custom", "registry.local/custom:1");
        request.build_context = Some("FROM ubuntu:24.04".into());
        request.entrypoint = vec!["/bin/app".into()];
        let s = f.pipeline.create(request).await.unwrap();
        assert_eq!(s.state, SnapshotState::BuildPending);

        f.pipeline.advance().await.unwrap();
        assert_eq!(f.pipeline.get(&s.id).await.unwrap().state, SnapshotState::Building);
        drain_jobs(&f).await;
        assert_eq!(f.pipeline.get(&s.id).await.unwrap().state, SnapshotState::Pending);

        f.pipeline.advance().await.unwrap();
        drain_jobs(&f).await;
        f.pipeline.advance().await.unwrap();
        let s = f.pipeline.get(&s.id).await.unwrap();
        assert_eq!(s.state, SnapshotState::Active);
        assert_eq!(s.entrypoint, vec!["/bin/app"]);
        assert_eq!(f.api.count("build_snapshot"), 1);
        assert_eq!(f.api.count("pull_snapshot"), 1);
    }

    #[tokio::test]
    async fn failed_build_is_recorded() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let mut request = NewSnapshot::new("org", "custom", "custom:1");
        request.build_context = Some("FROM nothing".into());
        let s = f.pipeline.create(request).await.unwrap();
        f.api.fail_next("build_snapshot", "manifest unknown");

        f.pipeline.advance().await.unwrap();
        drain_jobs(&f).await;
        let s = f.pipeline.get(&s.id).await.unwrap();
        assert_eq!(s.state, SnapshotState::BuildFailed);
        assert!(s.error_reason.unwrap().contains("manifest unknown"));
    }

    #[tokio::test]
    async fn oversized_image_fails_validation() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "huge", "huge:1"))
            .await
            .unwrap();
        f.api.set_snapshot_info("huge:1", SnapshotInfo {
            size_gib: 25.125,
            entrypoint: Vec::new(),
        });
        f.pipeline.advance().await.unwrap();
        drain_jobs(&f).await;
        f.pipeline.advance().await.unwrap();

        let s = f.pipeline.get(&s.id).await.unwrap();
        assert_eq!(s.state, SnapshotState::Error);
        assert_eq!(
            s.error_reason.as_deref(),
            Some("Snapshot size (25.13GB) exceeds maximum allowed size of 20GB")
        );
    }

    #[tokio::test]
    async fn waits_for_a_runner() {
        let mut draining = ready("r1", "eu", 80);
        draining.draining = true;
        let f = fixture(vec![draining, ready("r2", "us", 90)]).await;
        let mut request = NewSnapshot::new("org", "base", "base:1");
        request.regions.insert("eu".into());
        let s = f.pipeline.create(request).await.unwrap();

        assert_eq!(f.pipeline.advance().await.unwrap(), 0);
        assert_eq!(f.pipeline.get(&s.id).await.unwrap().state, SnapshotState::Pending);
        assert!(f.jobs.list_by_status(JobStatus::Pending).await.unwrap().is_empty());

        f.registry.insert_runner(&ready("r3", "eu", 10)).await.unwrap();
        f.pipeline.advance().await.unwrap();
        assert_eq!(
            f.pipeline.get(&s.id).await.unwrap().runner_id.as_deref(),
            Some("r3")
        );
    }

    #[tokio::test]
    async fn remove_deletes_after_runner_cleanup() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "base", "base:1"))
            .await
            .unwrap();
        f.pipeline.advance().await.unwrap();
        drain_jobs(&f).await;
        f.pipeline.advance().await.unwrap();

        f.pipeline.remove(&s.id).await.unwrap();
        f.pipeline.advance().await.unwrap();
        // Second tick while the job is pending enqueues nothing new.
        f.pipeline.advance().await.unwrap();
        let ran = drain_jobs(&f).await;
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].job_type, JobType::RemoveSnapshot);
        assert!(matches!(
            f.pipeline.get(&s.id).await,
            Err(Error::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unplaced_snapshot_is_removed_directly() {
        let f = fixture(Vec::new()).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "base", "base:1"))
            .await
            .unwrap();
        f.pipeline.remove(&s.id).await.unwrap();
        f.pipeline.advance().await.unwrap();
        assert!(f.pipeline.list("org").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activation_rules() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "base", "base:1"))
            .await
            .unwrap();
        assert!(f.pipeline.activate(&s.id).await.is_err());
        f.pipeline.advance().await.unwrap();
        drain_jobs(&f).await;
        f.pipeline.advance().await.unwrap();

        assert!(matches!(
            f.pipeline.activate(&s.id).await,
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(
            f.pipeline.deactivate(&s.id).await.unwrap().state,
            SnapshotState::Inactive
        );
        assert_eq!(
            f.pipeline.deactivate(&s.id).await.unwrap().state,
            SnapshotState::Inactive
        );
        assert_eq!(
            f.pipeline.activate(&s.id).await.unwrap().state,
            SnapshotState::Active
        );
    }

    #[tokio::test]
    async fn region_associations_limit_availability() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "base", "base:1"))
            .await
            .unwrap();
        assert!(s.is_available_in("us"));

        let s = f.pipeline.add_region(&s.id, "eu").await.unwrap();
        assert!(s.is_available_in("eu"));
        assert!(!s.is_available_in("us"));

        let s = f.pipeline.add_region(&s.id, "us").await.unwrap();
        let s = f.pipeline.remove_region(&s.id, "eu").await.unwrap();
        assert!(!s.is_available_in("eu"));
        assert!(s.is_available_in("us"));
    }

    #[tokio::test]
    async fn stale_job_result_is_ignored() {
        let f = fixture(vec![ready("r1", "eu", 80)]).await;
        let s = f
            .pipeline
            .create(NewSnapshot::new("org", "base", "base:1"))
            .await
            .unwrap();
        f.pipeline.advance().await.unwrap();
        let job = f.jobs.claim_next(now_ms()).await.unwrap().unwrap();
        f.pipeline.remove(&s.id).await.unwrap();

        let outcome = JobOutcome::Failed {
            error: SanitizedError {
                recoverable: false,
                error_reason: "boom".into(),
            },
            classification: Classification::Fatal,
        };
        f.pipeline.finish(&job, &outcome).await.unwrap();
        assert_eq!(f.pipeline.get(&s.id).await.unwrap().state, SnapshotState::Removing);
    }
}
