//! Disk lifecycle.
//!
//! Every operation holds the disk's lease lock for its whole duration, runner
//! call included, so two sandboxes can never race for the same disk. The
//! runner is resolved before any transitional state is written. Whether
//! the sandbox side of an attach is allowed (it must be stopped) is checked
//! by the caller under the sandbox lock.

use std::sync::Arc;

use {
    corral_common::{LockProvider, acquire, disk_lock_key, now_ms},
    corral_config::LocksConfig,
    corral_registry::RegistryStore,
    corral_runner_client::{DiskRequest, ForkDiskRequest, RunnerApi, RunnerTarget},
    tracing::{info, warn},
};

use crate::{
    Error, Result,
    disk::{Disk, DiskState},
    store::DiskStore,
};

pub struct DiskManager {
    store: Arc<dyn DiskStore>,
    registry: Arc<dyn RegistryStore>,
    api: Arc<dyn RunnerApi>,
    locks: Arc<dyn LockProvider>,
    lock_config: LocksConfig,
}

impl DiskManager {
    pub fn new(
        store: Arc<dyn DiskStore>,
        registry: Arc<dyn RegistryStore>,
        api: Arc<dyn RunnerApi>,
        locks: Arc<dyn LockProvider>,
        lock_config: LocksConfig,
    ) -> Self {
        Self {
            store,
            registry,
            api,
            locks,
            lock_config,
        }
    }

    pub async fn create(&self, organization_id: &str, name: &str, size_gib: u32) -> Result<Disk> {
        if name.trim().is_empty() {
            return Err(Error::message("disk name must not be empty"));
        }
        if size_gib == 0 {
            return Err(Error::message("disk size must be at least 1 GiB"));
        }
        let disk = Disk::new(organization_id, name, size_gib);
        self.store.insert(&disk).await?;
        info!(disk_id = %disk.id, organization_id, name, size_gib, "disk created");
        Ok(disk)
    }

    pub async fn get(&self, disk_id: &str) -> Result<Disk> {
        self.store
            .get(disk_id)
            .await?
            .ok_or_else(|| Error::DiskNotFound(disk_id.to_string()))
    }

    pub async fn list(&self, organization_id: &str) -> Result<Vec<Disk>> {
        self.store.list(organization_id).await
    }

    pub async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Disk> {
        self.store
            .find_by_name(organization_id, name)
            .await?
            .ok_or_else(|| Error::DiskNotFound(name.to_string()))
    }

    pub async fn attached_to(&self, sandbox_id: &str) -> Result<Vec<Disk>> {
        self.store.list_attached_to(sandbox_id).await
    }

    /// Attach to a sandbox. A disk already attached anywhere, even to the
    /// same sandbox, is rejected without touching the existing attachment.
    pub async fn attach(&self, disk_id: &str, sandbox_id: &str) -> Result<Disk> {
        let guard = self.lock(disk_id).await?;
        let result = self.attach_locked(disk_id, sandbox_id).await;
        guard.release().await?;
        result
    }

    async fn attach_locked(&self, disk_id: &str, sandbox_id: &str) -> Result<Disk> {
        let mut disk = self.get(disk_id).await?;
        if let Some(current) = disk.sandbox_id.clone() {
            return Err(Error::AlreadyAttached {
                disk_id: disk.id,
                sandbox_id: current,
            });
        }
        if !disk.state.is_attachable() {
            return Err(Error::invalid_state("disk", &disk.id, disk.state, "attach"));
        }
        disk.state = DiskState::Attached;
        disk.sandbox_id = Some(sandbox_id.to_string());
        self.save(&mut disk).await?;
        info!(disk_id, sandbox_id, "disk attached");
        Ok(disk)
    }

    pub async fn detach(&self, disk_id: &str) -> Result<Disk> {
        let guard = self.lock(disk_id).await?;
        let result = self.detach_locked(disk_id).await;
        guard.release().await?;
        result
    }

    async fn detach_locked(&self, disk_id: &str) -> Result<Disk> {
        let mut disk = self.get(disk_id).await?;
        if disk.state != DiskState::Attached || disk.sandbox_id.is_none() {
            return Err(Error::NotAttached(disk.id));
        }
        let sandbox_id = disk.sandbox_id.take();
        disk.state = DiskState::Detached;
        self.save(&mut disk).await?;
        info!(disk_id, sandbox_id = ?sandbox_id, "disk detached");
        Ok(disk)
    }

    /// Detach everything attached to a sandbox that is going away.
    pub async fn detach_all(&self, sandbox_id: &str) -> Result<Vec<Disk>> {
        let mut detached = Vec::new();
        for disk in self.store.list_attached_to(sandbox_id).await? {
            match self.detach(&disk.id).await {
                Ok(d) => detached.push(d),
                Err(Error::NotAttached(_)) => {},
                Err(e) => return Err(e),
            }
        }
        Ok(detached)
    }

    /// Copy a disk into a new one named `name`. The source is `locked` while
    /// the runner copies and returns to its previous state afterwards.
    pub async fn fork(&self, disk_id: &str, name: &str) -> Result<Disk> {
        let guard = self.lock(disk_id).await?;
        let result = self.fork_locked(disk_id, name).await;
        guard.release().await?;
        result
    }

    async fn fork_locked(&self, disk_id: &str, name: &str) -> Result<Disk> {
        let mut source = self.get(disk_id).await?;
        if !source.state.is_forkable() {
            return Err(Error::invalid_state("disk", &source.id, source.state, "fork"));
        }
        let target = match source.runner_id.as_deref() {
            Some(runner_id) => Some(self.target(runner_id).await?),
            None => None,
        };
        let mut fork = Disk::new(&source.organization_id, name, source.size_gib);
        fork.base_disk_id = Some(source.id.clone());
        fork.runner_id = source.runner_id.clone();
        fork.state = DiskState::Forking;
        self.store.insert(&fork).await?;

        let previous = source.state;
        source.locked_from = Some(previous);
        source.state = DiskState::Locked;
        self.save(&mut source).await?;

        let (outcome, done) = match &target {
            Some(target) => {
                let outcome = self
                    .api
                    .fork_disk(target, &ForkDiskRequest {
                        base_disk_id: source.id.clone(),
                        disk_id: fork.id.clone(),
                    })
                    .await;
                (outcome, DiskState::Ready)
            },
            // Never materialized on a runner; nothing to copy.
            None => (Ok(()), DiskState::Fresh),
        };

        source.state = source.locked_from.take().unwrap_or(previous);
        self.save(&mut source).await?;
        self.settle(&mut fork, outcome, done).await?;
        info!(disk_id = %fork.id, base_disk_id = disk_id, "disk forked");
        Ok(fork)
    }

    /// Materialize the disk on `runner_id`.
    pub async fn pull(&self, disk_id: &str, runner_id: &str) -> Result<Disk> {
        let guard = self.lock(disk_id).await?;
        let result = self.pull_locked(disk_id, runner_id).await;
        guard.release().await?;
        result
    }

    async fn pull_locked(&self, disk_id: &str, runner_id: &str) -> Result<Disk> {
        let mut disk = self.get(disk_id).await?;
        if !matches!(disk.state, DiskState::Fresh | DiskState::Stored) {
            return Err(Error::invalid_state("disk", &disk.id, disk.state, "pull"));
        }
        let target = self.target(runner_id).await?;
        disk.state = DiskState::Pulling;
        disk.runner_id = Some(runner_id.to_string());
        self.save(&mut disk).await?;

        let outcome = self.api.pull_disk(&target, &request(&disk)).await;
        self.settle(&mut disk, outcome, DiskState::Ready).await?;
        Ok(disk)
    }

    /// Move the disk image off its runner into storage.
    pub async fn push(&self, disk_id: &str) -> Result<Disk> {
        let guard = self.lock(disk_id).await?;
        let result = self.push_locked(disk_id).await;
        guard.release().await?;
        result
    }

    async fn push_locked(&self, disk_id: &str) -> Result<Disk> {
        let mut disk = self.get(disk_id).await?;
        let runner_id = match (disk.state, disk.runner_id.clone()) {
            (DiskState::Ready | DiskState::Detached, Some(runner_id)) => runner_id,
            _ => return Err(Error::invalid_state("disk", &disk.id, disk.state, "push")),
        };
        let target = self.target(&runner_id).await?;
        disk.state = DiskState::PendingPush;
        self.save(&mut disk).await?;
        disk.state = DiskState::Pushing;
        self.save(&mut disk).await?;

        let outcome = self.api.push_disk(&target, &request(&disk)).await;
        if outcome.is_ok() {
            disk.runner_id = None;
        }
        self.settle(&mut disk, outcome, DiskState::Stored).await?;
        Ok(disk)
    }

    /// Delete the disk. Attached disks must be detached first.
    pub async fn delete(&self, disk_id: &str) -> Result<Disk> {
        let guard = self.lock(disk_id).await?;
        let result = self.delete_locked(disk_id).await;
        guard.release().await?;
        result
    }

    async fn delete_locked(&self, disk_id: &str) -> Result<Disk> {
        let mut disk = self.get(disk_id).await?;
        if !(disk.state.is_attachable() || disk.state == DiskState::Error) || disk.sandbox_id.is_some() {
            return Err(Error::invalid_state("disk", &disk.id, disk.state, "delete"));
        }
        let target = match disk.runner_id.as_deref() {
            Some(runner_id) => Some(self.target(runner_id).await?),
            None => None,
        };
        disk.state = DiskState::PendingDelete;
        self.save(&mut disk).await?;

        let outcome = match &target {
            Some(target) => {
                disk.state = DiskState::Deleting;
                self.save(&mut disk).await?;
                self.api.delete_disk(target, &disk.id).await
            },
            None => Ok(()),
        };
        self.settle(&mut disk, outcome, DiskState::Deleted).await?;
        info!(disk_id, "disk deleted");
        Ok(disk)
    }

    async fn settle(
        &self,
        disk: &mut Disk,
        outcome: corral_runner_client::Result<()>,
        done: DiskState,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                disk.state = done;
                disk.error_reason = None;
                self.save(disk).await
            },
            Err(e) => {
                warn!(disk_id = %disk.id, error = %e, "disk operation failed");
                disk.state = DiskState::Error;
                disk.error_reason = Some(e.to_string());
                self.save(disk).await?;
                Err(e.into())
            },
        }
    }

    async fn save(&self, disk: &mut Disk) -> Result<()> {
        disk.updated_at_ms = now_ms();
        self.store.update(disk).await
    }

    async fn target(&self, runner_id: &str) -> Result<RunnerTarget> {
        let runner = self
            .registry
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| corral_registry::Error::runner_not_found(runner_id))?;
        Ok(runner.target())
    }

    async fn lock(&self, disk_id: &str) -> Result<corral_common::LockGuard> {
        Ok(acquire(
            &self.locks,
            &disk_lock_key(disk_id),
            self.lock_config.ttl(),
            self.lock_config.wait(),
        )
        .await?)
    }
}

fn request(disk: &Disk) -> DiskRequest {
    DiskRequest {
        disk_id: disk.id.clone(),
        size_gib: disk.size_gib,
    }
}
