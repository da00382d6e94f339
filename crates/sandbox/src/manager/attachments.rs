//! Disks, network policy and backups of an existing sandbox.

use {
    corral_jobs::JobType,
    corral_runner_client::NetworkSettings,
    tracing::info,
};

use super::SandboxManager;
use crate::{
    Error, Result,
    types::{BackupState, Sandbox, SandboxState},
};

impl SandboxManager {
    /// Attach a disk to a stopped sandbox. The disk lock is taken inside the
    /// sandbox lock, always in that order.
    pub async fn attach_disk(&self, id: &str, disk_id: &str) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = async {
            let mut sandbox = self.get(id).await?;
            if sandbox.state != SandboxState::Stopped {
                return Err(Error::invalid_state(id, sandbox.state, "attach a disk to"));
            }
            self.disks.attach(disk_id, id).await?;
            if !sandbox.disks.iter().any(|d| d == disk_id) {
                sandbox.disks.push(disk_id.to_string());
            }
            self.save(&mut sandbox).await?;
            info!(sandbox_id = id, disk_id, "disk attached to sandbox");
            Ok(sandbox)
        }
        .await;
        guard.release().await?;
        result
    }

    pub async fn detach_disk(&self, id: &str, disk_id: &str) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = async {
            let mut sandbox = self.get(id).await?;
            if sandbox.state != SandboxState::Stopped {
                return Err(Error::invalid_state(id, sandbox.state, "detach a disk from"));
            }
            let disk = self.disks.get(disk_id).await?;
            if disk.sandbox_id.as_deref() != Some(id) {
                return Err(corral_volumes::Error::NotAttached(disk.id).into());
            }
            self.disks.detach(disk_id).await?;
            sandbox.disks.retain(|d| d != disk_id);
            self.save(&mut sandbox).await?;
            info!(sandbox_id = id, disk_id, "disk detached from sandbox");
            Ok(sandbox)
        }
        .await;
        guard.release().await?;
        result
    }

    /// Replace the sandbox's outbound network policy and push it to the runner.
    pub async fn update_network(&self, id: &str, settings: NetworkSettings) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = async {
            let mut sandbox = self.get(id).await?;
            if !matches!(sandbox.state, SandboxState::Started | SandboxState::Stopped) {
                return Err(Error::invalid_state(id, sandbox.state, "update network of"));
            }
            if sandbox.network == settings {
                return Ok(sandbox);
            }
            if self.job_in_flight(id).await? {
                return Err(Error::conflict(format!("sandbox {id} has a job in flight")));
            }
            sandbox.network = settings;
            sandbox.touch();
            let state = sandbox.state;
            self.enqueue(&mut sandbox, JobType::UpdateSandboxNetworkSettings, state)
                .await?;
            Ok(sandbox)
        }
        .await;
        guard.release().await?;
        result
    }

    /// Back up a started sandbox now.
    pub async fn request_backup(&self, id: &str) -> Result<Sandbox> {
        let guard = self.lock(id).await?;
        let result = self.request_backup_locked(id).await;
        guard.release().await?;
        result
    }

    /// Like [`SandboxManager::request_backup`], skipping a busy sandbox.
    pub async fn try_request_backup(&self, id: &str) -> Result<Option<Sandbox>> {
        let Some(guard) = self.try_lock(id).await? else {
            return Ok(None);
        };
        let result = self.request_backup_locked(id).await;
        guard.release().await?;
        result.map(Some)
    }

    async fn request_backup_locked(&self, id: &str) -> Result<Sandbox> {
        let mut sandbox = self.get(id).await?;
        if sandbox.state != SandboxState::Started {
            return Err(Error::invalid_state(id, sandbox.state, "back up"));
        }
        if matches!(
            sandbox.backup_state,
            BackupState::Pending | BackupState::InProgress
        ) || self.job_in_flight(id).await?
        {
            return Err(Error::conflict(format!("sandbox {id} is already busy")));
        }
        self.enqueue(&mut sandbox, JobType::CreateBackup, SandboxState::Started)
            .await?;
        Ok(sandbox)
    }
}
