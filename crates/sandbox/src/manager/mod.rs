//! The sandbox state machine.
//!
//! Every state-changing operation takes `sandbox:{id}:state-change`, reads the
//! row, records the new desired state and runs one reconciliation step before
//! releasing the lock. Runner work happens later in the dispatcher; its
//! result comes back through [`JobHandler::finish`](corral_jobs::JobHandler),
//! which re-takes the lock to apply it.

mod attachments;
mod copies;
mod outcome;
mod pools;

use std::sync::Arc;

use {
    corral_common::{
        LockGuard, LockProvider, Resources, acquire, now_ms, sandbox_lock_key, try_acquire,
    },
    corral_config::{BackupConfig, CorralConfig, LocksConfig, SweepsConfig},
    corral_jobs::{Job, JobStore, JobType, ResourceKind},
    corral_registry::{PlacementRequest, RegistryStore, Runner, RunnerAllocator, RunnerRegistry},
    corral_runner_client::{RunnerApi, RunnerTarget},
    corral_volumes::{DiskManager, SnapshotPipeline, SnapshotState},
    serde_json::json,
    tokio::sync::Notify,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    reconcile::{Facts, Step, plan},
    store::{SandboxStore, WarmPoolStore},
    types::{BackupState, DesiredState, NewSandbox, Sandbox, SandboxState},
};

/// Settle steps applied back to back before a reconciliation gives up for
/// this round; each one is a plain row write.
const MAX_SETTLE_STEPS: usize = 4;

/// Stores and collaborators the manager drives.
pub struct Services {
    pub store: Arc<dyn SandboxStore>,
    pub pools: Arc<dyn WarmPoolStore>,
    pub jobs: Arc<dyn JobStore>,
    pub registry: Arc<dyn RegistryStore>,
    pub api: Arc<dyn RunnerApi>,
    pub disks: Arc<DiskManager>,
    pub snapshots: Arc<SnapshotPipeline>,
    pub locks: Arc<dyn LockProvider>,
}

pub struct SandboxManager {
    store: Arc<dyn SandboxStore>,
    pools: Arc<dyn WarmPoolStore>,
    jobs: Arc<dyn JobStore>,
    registry: Arc<dyn RegistryStore>,
    api: Arc<dyn RunnerApi>,
    disks: Arc<DiskManager>,
    snapshots: Arc<SnapshotPipeline>,
    locks: Arc<dyn LockProvider>,
    allocator: RunnerAllocator,
    lock_config: LocksConfig,
    sweeps: SweepsConfig,
    backups: BackupConfig,
    score_threshold: u32,
    replenish: Arc<Notify>,
}

impl SandboxManager {
    pub fn new(services: Services, config: &CorralConfig) -> Self {
        Self {
            allocator: RunnerAllocator::new(
                Arc::clone(&services.registry),
                config.allocator.clone(),
            ),
            store: services.store,
            pools: services.pools,
            jobs: services.jobs,
            registry: services.registry,
            api: services.api,
            disks: services.disks,
            snapshots: services.snapshots,
            locks: services.locks,
            lock_config: config.locks.clone(),
            sweeps: config.sweeps.clone(),
            backups: config.backups.clone(),
            score_threshold: config.allocator.availability_score_threshold,
            replenish: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SandboxStore> {
        &self.store
    }

    pub fn backup_config(&self) -> &BackupConfig {
        &self.backups
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Result<Sandbox> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(id))
    }

    pub async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Sandbox> {
        self.store
            .find_by_name(organization_id, name)
            .await?
            .ok_or_else(|| Error::not_found(name))
    }

    pub async fn list(&self, organization_id: &str) -> Result<Vec<Sandbox>> {
        self.store.list(organization_id).await
    }

    /// Live sandboxes placed on a runner, i.e. what blocks its removal.
    pub async fn hosted_count(&self, runner_id: &str) -> Result<usize> {
        Ok(self.store.list_on_runner(runner_id).await?.len())
    }

    /// Delete a draining runner that no longer hosts anything.
    pub async fn remove_runner(&self, runner_id: &str) -> Result<()> {
        let hosted = self.hosted_count(runner_id).await?;
        RunnerRegistry::new(Arc::clone(&self.registry))
            .remove(runner_id, hosted)
            .await?;
        Ok(())
    }

    // ── Creation ────────────────────────────────────────────────────────────

    /// Create a sandbox, from a matching warm pool when one has an idle
    /// member, otherwise by placing it on a runner.
    ///
    /// When no runner has room the row is kept in `creating` and the
    /// capacity error is returned; the reconcile sweep places it later.
    pub async fn create(&self, request: NewSandbox) -> Result<Sandbox> {
        if request.name.trim().is_empty() {
            return Err(Error::message("sandbox name must not be empty"));
        }
        if self
            .store
            .find_by_name(&request.organization_id, &request.name)
            .await?
            .is_some()
        {
            return Err(Error::conflict(format!(
                "sandbox with name {} already exists",
                request.name
            )));
        }
        if let Some(sandbox) = self.claim_from_pool(&request).await? {
            return Ok(sandbox);
        }
        self.create_cold(request, None).await
    }

    async fn create_cold(&self, request: NewSandbox, pool_id: Option<String>) -> Result<Sandbox> {
        let mut sandbox = request.into_sandbox();
        sandbox.pool_id = pool_id;
        if let Some(name) = sandbox.snapshot.clone() {
            let snapshot = self
                .snapshots
                .find_by_name(&sandbox.organization_id, &name)
                .await?;
            if snapshot.class != sandbox.class {
                return Err(Error::message(format!(
                    "snapshot {name} requires {} runners",
                    snapshot.class
                )));
            }
            match snapshot.state {
                SnapshotState::Active => {
                    sandbox.image = Some(snapshot.image_name.clone());
                    sandbox.resources = at_least(&sandbox.resources, &snapshot.resources);
                    if let Err(e) = self.snapshots.touch(&snapshot.id).await {
                        debug!(snapshot_id = %snapshot.id, error = %e, "failed to record snapshot use");
                    }
                },
                SnapshotState::Removing => {
                    return Err(Error::message(format!("snapshot {name} is being removed")));
                },
                state if SnapshotState::IN_PIPELINE.contains(&state) => {
                    sandbox.state = SandboxState::PendingBuild;
                },
                state => {
                    return Err(Error::message(format!("snapshot {name} is {state}")));
                },
            }
        }
        self.store.insert(&sandbox).await?;
        info!(
            sandbox_id = %sandbox.id,
            organization_id = %sandbox.organization_id,
            name = %sandbox.name,
            state = %sandbox.state,
            pooled = sandbox.pool_id.is_some(),
            "sandbox created"
        );
        self.reconcile(&sandbox.id).await
    }

    // ── Desired-state changes ───────────────────────────────────────────────

    pub async fn start(&self, id: &str) -> Result<Sandbox> {
        self.set_desired(id, DesiredState::Started).await
    }

    pub async fn stop(&self, id: &str) -> Result<Sandbox> {
        self.set_desired(id, DesiredState::Stopped).await
    }

    pub async fn archive(&self, id: &str) -> Result<Sandbox> {
        self.set_desired(id, DesiredState::Archived).await
    }

    pub async fn destroy(&self, id: &str) -> Result<Sandbox> {
        self.set_desired(id, DesiredState::Destroyed).await
    }

    /// Record a new desired state and take the first step towards it.
    pub async fn set_desired(&self, id: &str, desired: DesiredState) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = self.set_desired_locked(id, desired).await;
        guard.release().await?;
        result
    }

    async fn set_desired_locked(&self, id: &str, desired: DesiredState) -> Result<Sandbox> {
        let mut sandbox = self.get(id).await?;
        if sandbox.desired_state == DesiredState::Destroyed {
            if desired == DesiredState::Destroyed {
                return Ok(sandbox);
            }
            return Err(Error::invalid_state(id, sandbox.state, action_name(desired)));
        }
        if !accepts(sandbox.state, desired) {
            return Err(Error::invalid_state(id, sandbox.state, action_name(desired)));
        }
        sandbox.desired_state = desired;
        sandbox.touch();
        self.save(&mut sandbox).await?;
        info!(sandbox_id = id, state = %sandbox.state, desired = %desired, "desired state set");
        self.reconcile_locked(id).await
    }

    /// Re-check a sandbox a background sweep picked from an unlocked listing.
    ///
    /// Skips it when someone else holds the lock. `decide` sees the fresh row
    /// and returns the desired state to set, if any.
    pub async fn try_transition(
        &self,
        id: &str,
        decide: impl FnOnce(&Sandbox) -> Option<DesiredState> + Send,
    ) -> Result<Option<Sandbox>> {
        let Some(guard) = self.try_lock(id).await? else {
            debug!(sandbox_id = id, "sandbox busy, skipped");
            return Ok(None);
        };
        let result = self.try_transition_locked(id, decide).await;
        guard.release().await?;
        result
    }

    async fn try_transition_locked(
        &self,
        id: &str,
        decide: impl FnOnce(&Sandbox) -> Option<DesiredState>,
    ) -> Result<Option<Sandbox>> {
        let Some(mut sandbox) = self.store.get(id).await? else {
            return Ok(None);
        };
        let Some(desired) = decide(&sandbox) else {
            return Ok(None);
        };
        if sandbox.desired_state == desired || !accepts(sandbox.state, desired) {
            return Ok(None);
        }
        sandbox.desired_state = desired;
        self.save(&mut sandbox).await?;
        info!(sandbox_id = id, state = %sandbox.state, desired = %desired, "sweep set desired state");
        self.reconcile_locked(id).await.map(Some)
    }

    /// Mark the sandbox as used now. Inactivity sweeps measure from here.
    pub async fn record_activity(&self, id: &str) -> Result<()> {
        let guard = self.lock(id).await?;
        let result = async {
            let mut sandbox = self.get(id).await?;
            sandbox.touch();
            self.save(&mut sandbox).await
        }
        .await;
        guard.release().await?;
        result
    }

    /// Grow or shrink a started or stopped sandbox on its current runner.
    ///
    /// Growth is reserved up front; shrinkage is returned once the runner
    /// confirms the resize.
    pub async fn resize(&self, id: &str, resources: Resources) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = self.resize_locked(id, resources).await;
        guard.release().await?;
        result
    }

    async fn resize_locked(&self, id: &str, resources: Resources) -> Result<Sandbox> {
        let mut sandbox = self.get(id).await?;
        let settled = matches!(
            (sandbox.state, sandbox.desired_state),
            (SandboxState::Started, DesiredState::Started)
                | (SandboxState::Stopped, DesiredState::Stopped)
        );
        if !settled || self.job_in_flight(id).await? {
            return Err(Error::invalid_state(id, sandbox.state, "resize"));
        }
        if resources.disk_gib < sandbox.resources.disk_gib {
            return Err(Error::message("disk size cannot be reduced"));
        }
        if resources == sandbox.resources {
            return Ok(sandbox);
        }
        let runner = self.runner_of(&sandbox).await?;
        let growth = sandbox.resources.growth_to(&resources);
        self.allocator.reserve_on(&runner, &growth).await?;

        let mut before = sandbox.clone();
        sandbox.pending_resources = Some(resources);
        sandbox.resize_from = Some(sandbox.state);
        sandbox.desired_state = DesiredState::Resized;
        sandbox.touch();
        if let Err(e) = self
            .enqueue(&mut sandbox, JobType::ResizeSandbox, SandboxState::Resizing)
            .await
        {
            self.save(&mut before).await?;
            self.allocator.release(&runner.id, &growth).await?;
            return Err(e);
        }
        info!(sandbox_id = id, runner_id = %runner.id, "resize requested");
        Ok(sandbox)
    }

    /// Retry a sandbox parked in `error` with a recoverable failure.
    pub async fn recover(&self, id: &str) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = self.recover_locked(id).await;
        guard.release().await?;
        result
    }

    async fn recover_locked(&self, id: &str) -> Result<Sandbox> {
        let mut sandbox = self.get(id).await?;
        if sandbox.state != SandboxState::Error
            || !sandbox.recoverable
            || sandbox.desired_state == DesiredState::Destroyed
            || sandbox.runner_id.is_none()
            || self.job_in_flight(id).await?
        {
            return Err(Error::invalid_state(id, sandbox.state, "recover"));
        }
        sandbox.desired_state = DesiredState::Started;
        sandbox.touch();
        self.enqueue(&mut sandbox, JobType::RecoverSandbox, SandboxState::Starting)
            .await?;
        info!(sandbox_id = id, recovery_type = ?sandbox.recovery_type, "recovery requested");
        Ok(sandbox)
    }

    // ── Reconciliation ──────────────────────────────────────────────────────

    /// Take the next step towards the desired state, waiting for the lock.
    pub async fn reconcile(&self, id: &str) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = self.reconcile_locked(id).await;
        guard.release().await?;
        result
    }

    /// Like [`SandboxManager::reconcile`] but skips a sandbox that is busy.
    pub async fn try_reconcile(&self, id: &str) -> Result<Option<Sandbox>> {
        let Some(guard) = self.try_lock(id).await? else {
            return Ok(None);
        };
        let result = self.reconcile_locked(id).await;
        guard.release().await?;
        result.map(Some)
    }

    async fn reconcile_locked(&self, id: &str) -> Result<Sandbox> {
        let mut sandbox = self.get(id).await?;
        for _ in 0..MAX_SETTLE_STEPS {
            let facts = self.facts(&sandbox).await?;
            match plan(&sandbox, &facts) {
                Step::Idle => break,
                Step::Settle(state) => self.settle(&mut sandbox, state).await?,
                Step::FailBuild(reason) => {
                    warn!(sandbox_id = id, reason = %reason, "snapshot for sandbox failed");
                    sandbox.set_state(SandboxState::BuildFailed);
                    sandbox.error_reason = Some(reason);
                    self.save(&mut sandbox).await?;
                    break;
                },
                Step::Enqueue { job, next } => {
                    self.enqueue(&mut sandbox, job, next).await?;
                    break;
                },
                Step::Place { next } => {
                    self.place(&mut sandbox, next).await?;
                    break;
                },
            }
        }
        Ok(sandbox)
    }

    async fn facts(&self, sandbox: &Sandbox) -> Result<Facts> {
        let job_in_flight = self.job_in_flight(&sandbox.id).await?;
        let snapshot = match (sandbox.state, &sandbox.snapshot) {
            (
                SandboxState::PendingBuild
                | SandboxState::BuildingSnapshot
                | SandboxState::PullingSnapshot,
                Some(name),
            ) => match self
                .snapshots
                .find_by_name(&sandbox.organization_id, name)
                .await
            {
                Ok(snapshot) => Some(snapshot.state),
                Err(corral_volumes::Error::SnapshotNotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
            _ => None,
        };
        let archiving_on_runner = match (&sandbox.runner_id, sandbox.desired_state) {
            (Some(runner_id), DesiredState::Archived) => self
                .store
                .list_on_runner(runner_id)
                .await?
                .iter()
                .filter(|s| s.state == SandboxState::Archiving)
                .count(),
            _ => 0,
        };
        Ok(Facts {
            job_in_flight,
            snapshot,
            archiving_on_runner,
            max_archiving_per_runner: self.sweeps.max_archiving_per_runner,
        })
    }

    async fn settle(&self, sandbox: &mut Sandbox, state: SandboxState) -> Result<()> {
        if state == SandboxState::Destroyed {
            self.release_reservation(sandbox).await?;
            self.disks.detach_all(&sandbox.id).await?;
            sandbox.disks.clear();
        }
        debug!(sandbox_id = %sandbox.id, from = %sandbox.state, to = %state, "sandbox settled");
        sandbox.set_state(state);
        self.save(sandbox).await
    }

    /// Reserve a runner and enqueue the create job on it.
    async fn place(&self, sandbox: &mut Sandbox, next: SandboxState) -> Result<()> {
        if sandbox.image.is_none()
            && let Some(name) = &sandbox.snapshot
        {
            let snapshot = self
                .snapshots
                .find_by_name(&sandbox.organization_id, name)
                .await?;
            sandbox.image = Some(snapshot.image_name);
        }
        let mut request =
            PlacementRequest::new(sandbox.resources.clone(), &sandbox.region, sandbox.class);
        request.organization_id = sandbox.organization_id.clone();
        request.dedicated_only = sandbox.dedicated_only;
        let runner = match self.allocator.allocate(&request).await {
            Ok(runner) => runner,
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, error = %e, "sandbox left unplaced");
                return Err(e.into());
            },
        };

        sandbox.runner_id = Some(runner.id.clone());
        if let Err(e) = self.enqueue(sandbox, JobType::CreateSandbox, next).await {
            sandbox.runner_id = None;
            self.save(sandbox).await?;
            self.allocator.release(&runner.id, &sandbox.resources).await?;
            return Err(e);
        }
        info!(sandbox_id = %sandbox.id, runner_id = %runner.id, state = %next, "sandbox placed");
        Ok(())
    }

    /// Move to `next` and enqueue `job_type`. The state is written first so
    /// an interruption leaves a transitional state the reconciler re-enqueues.
    async fn enqueue(
        &self,
        sandbox: &mut Sandbox,
        job_type: JobType,
        next: SandboxState,
    ) -> Result<Job> {
        let job = self.job_for(sandbox, job_type, next);
        self.enqueue_job(sandbox, job, next).await
    }

    async fn enqueue_job(&self, sandbox: &mut Sandbox, job: Job, next: SandboxState) -> Result<Job> {
        let before = sandbox.clone();
        let job_type = job.job_type;
        sandbox.set_state(next);
        if job_type == JobType::CreateBackup {
            sandbox.backup_state = BackupState::Pending;
        }
        self.save(sandbox).await?;
        if let Err(e) = self.jobs.enqueue(&job).await {
            *sandbox = before;
            self.save(sandbox).await?;
            return Err(e.into());
        }
        info!(
            sandbox_id = %sandbox.id,
            job_id = %job.id,
            job_type = %job_type,
            runner_id = ?job.runner_id,
            state = %next,
            "job enqueued"
        );
        Ok(job)
    }

    fn job_for(&self, sandbox: &Sandbox, job_type: JobType, next: SandboxState) -> Job {
        let payload = match job_type {
            JobType::CreateSandbox => json!({
                "restoreFrom": (next == SandboxState::Restoring)
                    .then(|| sandbox.backup_refs.last().cloned())
                    .flatten(),
            }),
            JobType::CreateBackup => json!({
                "archive": sandbox.desired_state == DesiredState::Archived,
                "backupRef": format!("backups/{}:{}", sandbox.id, now_ms()),
            }),
            JobType::RecoverSandbox => json!({ "recoveryType": sandbox.recovery_type }),
            _ => serde_json::Value::Null,
        };
        let job = Job::new(job_type, &sandbox.id).with_payload(payload);
        match &sandbox.runner_id {
            Some(runner_id) => job.on_runner(runner_id),
            None => job,
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    async fn lock(&self, id: &str) -> Result<LockGuard> {
        Ok(acquire(
            &self.locks,
            &sandbox_lock_key(id),
            self.lock_config.ttl(),
            self.lock_config.wait(),
        )
        .await?)
    }

    async fn try_lock(&self, id: &str) -> Result<Option<LockGuard>> {
        Ok(try_acquire(&self.locks, &sandbox_lock_key(id), self.lock_config.ttl()).await?)
    }

    async fn save(&self, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.updated_at_ms = now_ms();
        self.store.update(sandbox).await
    }

    async fn job_in_flight(&self, id: &str) -> Result<bool> {
        Ok(self
            .jobs
            .active_for_resource(ResourceKind::Sandbox, id)
            .await?
            .is_some())
    }

    async fn runner_of(&self, sandbox: &Sandbox) -> Result<Runner> {
        let runner_id = sandbox
            .runner_id
            .as_deref()
            .ok_or_else(|| Error::message(format!("sandbox {} is not placed", sandbox.id)))?;
        Ok(self
            .registry
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| corral_registry::Error::runner_not_found(runner_id))?)
    }

    async fn target(&self, runner_id: &str) -> Result<RunnerTarget> {
        Ok(self
            .registry
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| corral_registry::Error::runner_not_found(runner_id))?
            .target())
    }

    /// Hand the sandbox's resources back to its runner and unplace it.
    async fn release_reservation(&self, sandbox: &mut Sandbox) -> Result<()> {
        if let Some(runner_id) = sandbox.runner_id.take() {
            if sandbox.state.occupies_runner() {
                self.allocator.release(&runner_id, &sandbox.resources).await?;
            }
            if let Some(pending) = sandbox.pending_resources.take() {
                let growth = sandbox.resources.growth_to(&pending);
                self.allocator.release(&runner_id, &growth).await?;
            }
        }
        Ok(())
    }
}

/// Whether `desired` may be requested while the sandbox is in `state`.
fn accepts(state: SandboxState, desired: DesiredState) -> bool {
    use SandboxState as S;
    match desired {
        DesiredState::Destroyed => state != S::Destroyed,
        DesiredState::Started => !matches!(
            state,
            S::Error | S::BuildFailed | S::Unknown | S::Destroying | S::Destroyed
        ),
        DesiredState::Stopped => matches!(
            state,
            S::Started
                | S::Starting
                | S::Stopping
                | S::Stopped
                | S::Creating
                | S::Restoring
                | S::Resizing
                | S::PendingArchive
        ),
        DesiredState::Archived => matches!(
            state,
            S::Started | S::Stopping | S::Stopped | S::PendingArchive | S::Archiving | S::Archived
        ),
        DesiredState::Resized => false,
    }
}

fn action_name(desired: DesiredState) -> &'static str {
    match desired {
        DesiredState::Started => "start",
        DesiredState::Stopped => "stop",
        DesiredState::Resized => "resize",
        DesiredState::Archived => "archive",
        DesiredState::Destroyed => "destroy",
    }
}

/// Per-dimension maximum of the request and the snapshot's minimum shape.
fn at_least(requested: &Resources, minimum: &Resources) -> Resources {
    requested.saturating_add(&requested.growth_to(minimum))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(SandboxState::Stopped, DesiredState::Started, true)]
    #[case(SandboxState::Error, DesiredState::Started, false)]
    #[case(SandboxState::Error, DesiredState::Destroyed, true)]
    #[case(SandboxState::Archived, DesiredState::Stopped, false)]
    #[case(SandboxState::Archived, DesiredState::Started, true)]
    #[case(SandboxState::Started, DesiredState::Archived, true)]
    #[case(SandboxState::Creating, DesiredState::Archived, false)]
    #[case(SandboxState::Destroyed, DesiredState::Destroyed, false)]
    #[case(SandboxState::Started, DesiredState::Resized, false)]
    fn desired_state_acceptance(
        #[case] state: SandboxState,
        #[case] desired: DesiredState,
        #[case] expected: bool,
    ) {
        assert_eq!(accepts(state, desired), expected);
    }

    #[test]
    fn snapshot_minimum_raises_request() {
        let requested = Resources::new(1, 4, 3);
        let minimum = Resources::new(2, 2, 10);
        assert_eq!(
            at_least(&requested, &minimum),
            Resources::new(2, 4, 10)
        );
    }
}
