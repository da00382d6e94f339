//! Executing sandbox jobs against runners and applying their results.

use {
    async_trait::async_trait,
    corral_common::now_ms,
    corral_jobs::{
        Classification, Job, JobError, JobHandler, JobOutcome, JobType, RecoveryType,
        SanitizedError,
    },
    corral_runner_client::{
        BackupRequest, CopySandboxRequest, CreateSandboxRequest, SandboxSnapshotRequest,
    },
    corral_volumes::NewSnapshot,
    secrecy::ExposeSecret,
    tracing::{debug, info, warn},
};

use super::SandboxManager;
use crate::{
    Result,
    types::{BackupState, DesiredState, Sandbox, SandboxState},
};

fn payload_str<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.payload.get(key).and_then(|v| v.as_str())
}

fn is_archive(job: &Job) -> bool {
    job.payload
        .get("archive")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Whether a result of `job` still applies to a sandbox in `state`. Anything
/// else means the sandbox moved on and the result is stale.
fn applies_to(job: &Job, state: SandboxState) -> bool {
    use SandboxState as S;
    match job.job_type {
        JobType::CreateSandbox => matches!(state, S::Creating | S::Restoring),
        JobType::StartSandbox | JobType::RecoverSandbox => state == S::Starting,
        JobType::StopSandbox => state == S::Stopping,
        JobType::DestroySandbox => state == S::Destroying,
        JobType::ResizeSandbox => state == S::Resizing,
        JobType::CreateBackup if is_archive(job) => state == S::Archiving,
        JobType::ForkSandbox | JobType::CloneSandbox => state == S::Creating,
        JobType::CreateBackup
        | JobType::UpdateSandboxNetworkSettings
        | JobType::CreateSandboxSnapshot => state != S::Destroyed,
        JobType::BuildSnapshot | JobType::PullSnapshot | JobType::RemoveSnapshot => false,
    }
}

/// The settled state a finished resize returns to.
fn settled_desired(state: SandboxState) -> DesiredState {
    match state {
        SandboxState::Stopped => DesiredState::Stopped,
        _ => DesiredState::Started,
    }
}

impl SandboxManager {
    async fn mark_backup_in_progress(&self, id: &str) -> Result<()> {
        let guard = self.lock(id).await?;
        let result = async {
            let mut sandbox = self.get(id).await?;
            sandbox.backup_state = BackupState::InProgress;
            sandbox.backup_started_at_ms = Some(now_ms());
            self.save(&mut sandbox).await
        }
        .await;
        guard.release().await?;
        result
    }

    async fn apply_outcome(&self, job: &Job, outcome: &JobOutcome) -> Result<()> {
        let Some(mut sandbox) = self.store.get(&job.resource_id).await? else {
            debug!(job_id = %job.id, sandbox_id = %job.resource_id, "sandbox gone, result dropped");
            return Ok(());
        };
        if !applies_to(job, sandbox.state) {
            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                sandbox_id = %sandbox.id,
                state = %sandbox.state,
                "stale job result ignored"
            );
            return Ok(());
        }
        match outcome {
            JobOutcome::Succeeded => self.apply_success(&mut sandbox, job).await?,
            JobOutcome::Failed {
                error,
                classification,
            } => {
                self.apply_failure(&mut sandbox, job, error, *classification)
                    .await?;
            },
        }
        self.save(&mut sandbox).await
    }

    async fn apply_success(&self, sandbox: &mut Sandbox, job: &Job) -> Result<()> {
        match job.job_type {
            JobType::CreateSandbox
            | JobType::StartSandbox
            | JobType::RecoverSandbox
            | JobType::ForkSandbox
            | JobType::CloneSandbox => {
                sandbox.clear_error();
                sandbox.set_state(SandboxState::Started);
            },
            JobType::StopSandbox => sandbox.set_state(SandboxState::Stopped),
            JobType::DestroySandbox => {
                self.release_reservation(sandbox).await?;
                self.disks.detach_all(&sandbox.id).await?;
                sandbox.disks.clear();
                sandbox.set_state(SandboxState::Destroyed);
            },
            JobType::ResizeSandbox => {
                if let Some(target) = sandbox.pending_resources.take() {
                    let shrink = sandbox.resources.shrink_to(&target);
                    if let Some(runner_id) = &sandbox.runner_id {
                        self.allocator.release(runner_id, &shrink).await?;
                    }
                    sandbox.resources = target;
                }
                let back = sandbox.resize_from.take().unwrap_or(SandboxState::Started);
                if sandbox.desired_state == DesiredState::Resized {
                    sandbox.desired_state = settled_desired(back);
                }
                sandbox.set_state(back);
            },
            JobType::CreateBackup => {
                let now = now_ms();
                sandbox.backup_state = BackupState::Completed;
                sandbox.last_backup_at_ms = Some(now);
                sandbox.backup_failures = 0;
                if let Some(backup_ref) = payload_str(job, "backupRef") {
                    sandbox.backup_refs.push(backup_ref.to_string());
                }
                if is_archive(job) {
                    self.release_reservation(sandbox).await?;
                    sandbox.set_state(SandboxState::Archived);
                }
            },
            JobType::UpdateSandboxNetworkSettings => {
                debug!(sandbox_id = %sandbox.id, "network settings applied");
            },
            JobType::CreateSandboxSnapshot => self.register_sandbox_snapshot(sandbox, job).await,
            JobType::BuildSnapshot | JobType::PullSnapshot | JobType::RemoveSnapshot => {},
        }
        info!(sandbox_id = %sandbox.id, job_type = %job.job_type, state = %sandbox.state, "job succeeded");
        Ok(())
    }

    async fn register_sandbox_snapshot(&self, sandbox: &Sandbox, job: &Job) {
        let Some(name) = payload_str(job, "name") else {
            return;
        };
        let mut request = NewSnapshot::new(
            &sandbox.organization_id,
            name,
            format!("snapshots/{}/{name}", sandbox.id),
        );
        request.resources = sandbox.resources.clone();
        request.class = sandbox.class;
        match self.snapshots.create(request).await {
            Ok(snapshot) => {
                info!(sandbox_id = %sandbox.id, snapshot_id = %snapshot.id, name, "sandbox snapshot registered");
            },
            Err(e) => warn!(sandbox_id = %sandbox.id, name, error = %e, "failed to register sandbox snapshot"),
        }
    }

    async fn apply_failure(
        &self,
        sandbox: &mut Sandbox,
        job: &Job,
        error: &SanitizedError,
        classification: Classification,
    ) -> Result<()> {
        let reason = error.error_reason.clone();
        warn!(
            sandbox_id = %sandbox.id,
            job_id = %job.id,
            job_type = %job.job_type,
            %classification,
            reason = %reason,
            "job failed"
        );
        match job.job_type {
            JobType::CreateBackup => {
                sandbox.backup_state = BackupState::Error;
                sandbox.error_reason = Some(reason.clone());
                if is_archive(job) {
                    sandbox.backup_failures += 1;
                    if sandbox.backup_failures < self.backups.archive_retries {
                        sandbox.set_state(SandboxState::Stopped);
                    } else {
                        sandbox.set_error(reason, classification);
                    }
                }
            },
            JobType::UpdateSandboxNetworkSettings | JobType::CreateSandboxSnapshot => {
                sandbox.error_reason = Some(reason);
            },
            JobType::ResizeSandbox => {
                if let Some(target) = sandbox.pending_resources.take()
                    && let Some(runner_id) = &sandbox.runner_id
                {
                    let growth = sandbox.resources.growth_to(&target);
                    self.allocator.release(runner_id, &growth).await?;
                }
                let back = sandbox.resize_from.take().unwrap_or(SandboxState::Started);
                if sandbox.desired_state == DesiredState::Resized {
                    sandbox.desired_state = settled_desired(back);
                }
                sandbox.set_state(back);
                sandbox.error_reason = Some(reason);
            },
            _ => sandbox.set_error(reason, classification),
        }
        Ok(())
    }

    async fn execute_job(&self, job: &Job) -> std::result::Result<(), JobError> {
        let sandbox = self
            .store
            .get(&job.resource_id)
            .await
            .map_err(|e| JobError::external("loading sandbox", e))?
            .ok_or_else(|| JobError::message(format!("sandbox {} not found", job.resource_id)))?;
        let runner_id = job
            .runner_id
            .as_deref()
            .or(sandbox.runner_id.as_deref())
            .ok_or_else(|| JobError::message(format!("sandbox {} is not placed", sandbox.id)))?;
        let target = self
            .target(runner_id)
            .await
            .map_err(|e| JobError::external("resolving runner", e))?;
        let id = sandbox.id.as_str();

        match job.job_type {
            JobType::CreateSandbox => {
                let request = CreateSandboxRequest {
                    sandbox_id: sandbox.id.clone(),
                    snapshot: sandbox.image.clone().or_else(|| sandbox.snapshot.clone()),
                    os_user: sandbox.os_user.clone(),
                    resources: sandbox.resources.clone(),
                    env: sandbox.env.clone(),
                    network: sandbox.network.clone(),
                    auth_token: sandbox.auth_token.expose_secret().clone(),
                    restore_from: payload_str(job, "restoreFrom").map(str::to_string),
                    disks: sandbox.disks.clone(),
                };
                self.api.create_sandbox(&target, &request).await?;
            },
            JobType::StartSandbox => self.api.start_sandbox(&target, id).await?,
            JobType::StopSandbox => self.api.stop_sandbox(&target, id).await?,
            JobType::DestroySandbox => self.api.destroy_sandbox(&target, id).await?,
            JobType::ResizeSandbox => {
                let resources = sandbox
                    .pending_resources
                    .as_ref()
                    .ok_or_else(|| JobError::message(format!("sandbox {id} has no pending resize")))?;
                self.api.resize_sandbox(&target, id, resources).await?;
            },
            JobType::CreateBackup => {
                let backup_ref = payload_str(job, "backupRef")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("backups/{id}:{}", job.created_at_ms));
                self.mark_backup_in_progress(id)
                    .await
                    .map_err(|e| JobError::external("recording backup start", e))?;
                self.api
                    .create_backup(&target, &BackupRequest {
                        sandbox_id: sandbox.id.clone(),
                        backup_ref,
                    })
                    .await?;
                if is_archive(job) {
                    self.api.destroy_sandbox(&target, id).await?;
                }
            },
            JobType::UpdateSandboxNetworkSettings => {
                self.api
                    .update_network_settings(&target, id, &sandbox.network)
                    .await?;
            },
            JobType::CreateSandboxSnapshot => {
                let name = payload_str(job, "name")
                    .ok_or_else(|| JobError::message("snapshot job without a name"))?;
                self.api
                    .create_sandbox_snapshot(&target, &SandboxSnapshotRequest {
                        sandbox_id: sandbox.id.clone(),
                        name: name.to_string(),
                    })
                    .await?;
            },
            JobType::ForkSandbox | JobType::CloneSandbox => {
                let source = sandbox
                    .parent_sandbox_id
                    .clone()
                    .or_else(|| sandbox.source_sandbox_id.clone())
                    .ok_or_else(|| JobError::message(format!("sandbox {id} has no source")))?;
                let request = CopySandboxRequest {
                    source_sandbox_id: source,
                    target_sandbox_id: sandbox.id.clone(),
                    resources: sandbox.resources.clone(),
                };
                if job.job_type == JobType::ForkSandbox {
                    self.api.fork_sandbox(&target, &request).await?;
                } else {
                    self.api.clone_sandbox(&target, &request).await?;
                }
            },
            JobType::RecoverSandbox => {
                let recovery: Option<RecoveryType> = job
                    .payload
                    .get("recoveryType")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok());
                if recovery == Some(RecoveryType::StorageExpansion) {
                    self.api
                        .resize_sandbox(&target, id, &sandbox.resources)
                        .await?;
                }
                self.api.start_sandbox(&target, id).await?;
            },
            JobType::BuildSnapshot | JobType::PullSnapshot | JobType::RemoveSnapshot => {
                return Err(JobError::message(format!(
                    "{} is not a sandbox job",
                    job.job_type
                )));
            },
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SandboxManager {
    async fn execute(&self, job: &Job) -> std::result::Result<(), JobError> {
        self.execute_job(job).await
    }

    async fn finish(&self, job: &Job, outcome: &JobOutcome) -> std::result::Result<(), JobError> {
        let guard = self
            .lock(&job.resource_id)
            .await
            .map_err(|e| JobError::external("locking sandbox", e))?;
        let result = async {
            self.apply_outcome(job, outcome).await?;
            let Some(sandbox) = self.store.get(&job.resource_id).await? else {
                return Ok(());
            };
            // A failed job parks the sandbox; only the sweeps or an explicit
            // request move it on, so a runner that keeps failing is not hammered.
            if sandbox.state != SandboxState::Error
                && let Err(e) = self.reconcile_locked(&sandbox.id).await
            {
                warn!(sandbox_id = %sandbox.id, error = %e, "reconcile after job failed");
            }
            Ok::<(), crate::Error>(())
        }
        .await;
        guard
            .release()
            .await
            .map_err(|e| JobError::external("unlocking sandbox", e))?;
        result.map_err(|e| JobError::external("applying sandbox job result", e))
    }
}
