//! Warm pool administration, claiming and replenishment.

use std::sync::Arc;

use {
    corral_jobs::JobType,
    tokio::sync::Notify,
    tracing::{debug, info, warn},
};

use super::SandboxManager;
use crate::{
    Error, Result,
    types::{DesiredState, NewSandbox, Sandbox, SandboxState},
    warm_pool::WarmPool,
};

impl SandboxManager {
    /// Keep `size` idle sandboxes shaped like `template`.
    pub async fn create_pool(&self, template: &NewSandbox, size: u32) -> Result<WarmPool> {
        let key = template.pool_key();
        if self
            .pools
            .list_pools_for(&template.organization_id)
            .await?
            .iter()
            .any(|p| p.key() == key)
        {
            return Err(Error::conflict("a warm pool with this shape already exists"));
        }
        let pool = WarmPool::new(template, size);
        self.pools.upsert_pool(&pool).await?;
        info!(pool_id = %pool.id, organization_id = %pool.organization_id, size, "warm pool created");
        self.replenish.notify_one();
        Ok(pool)
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<WarmPool> {
        self.pools
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| Error::PoolNotFound(pool_id.to_string()))
    }

    pub async fn list_pools(&self, organization_id: &str) -> Result<Vec<WarmPool>> {
        self.pools.list_pools_for(organization_id).await
    }

    pub async fn set_pool_size(&self, pool_id: &str, size: u32) -> Result<WarmPool> {
        let mut pool = self.get_pool(pool_id).await?;
        pool.size = size;
        pool.updated_at_ms = corral_common::now_ms();
        self.pools.upsert_pool(&pool).await?;
        self.replenish.notify_one();
        Ok(pool)
    }

    /// Delete a pool and destroy its idle members.
    pub async fn delete_pool(&self, pool_id: &str) -> Result<()> {
        let pool = self.get_pool(pool_id).await?;
        self.pools.delete_pool(&pool.id).await?;
        for member in self.store.list_pool_members(&pool.id).await? {
            if let Err(e) = self.destroy(&member.id).await {
                warn!(pool_id, sandbox_id = %member.id, error = %e, "failed to destroy pool member");
            }
        }
        info!(pool_id, "warm pool deleted");
        Ok(())
    }

    /// Woken whenever a pool shrank or changed size.
    pub fn replenish_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.replenish)
    }

    /// Hand an idle member of a pool with exactly the requested shape to the
    /// caller. `None` when no pool matches or none of its members is free.
    pub(super) async fn claim_from_pool(&self, request: &NewSandbox) -> Result<Option<Sandbox>> {
        let key = request.pool_key();
        let Some(pool) = self
            .pools
            .list_pools_for(&request.organization_id)
            .await?
            .into_iter()
            .find(|p| p.key() == key)
        else {
            return Ok(None);
        };
        for member in self.store.list_pool_members(&pool.id).await? {
            if !is_idle(&member) {
                continue;
            }
            let Some(guard) = self.try_lock(&member.id).await? else {
                continue;
            };
            let claimed = self.claim_locked(&member.id, &pool, request).await;
            guard.release().await?;
            if let Some(sandbox) = claimed? {
                self.replenish.notify_one();
                return Ok(Some(sandbox));
            }
        }
        debug!(pool_id = %pool.id, "warm pool has no idle member");
        Ok(None)
    }

    async fn claim_locked(
        &self,
        member_id: &str,
        pool: &WarmPool,
        request: &NewSandbox,
    ) -> Result<Option<Sandbox>> {
        let Some(mut sandbox) = self.store.get(member_id).await? else {
            return Ok(None);
        };
        if sandbox.pool_id.as_deref() != Some(pool.id.as_str())
            || !is_idle(&sandbox)
            || self.job_in_flight(member_id).await?
        {
            return Ok(None);
        }
        let Ok(runner) = self.runner_of(&sandbox).await else {
            return Ok(None);
        };
        if !runner.is_schedulable(self.score_threshold) {
            return Ok(None);
        }
        if request.dedicated_only
            && runner.organization_id.as_deref() != Some(request.organization_id.as_str())
        {
            return Ok(None);
        }

        let network_changed = sandbox.network != request.network;
        sandbox.pool_id = None;
        sandbox.name = request.name.clone();
        sandbox.network = request.network.clone();
        sandbox.auto_stop_minutes = request.auto_stop_minutes;
        sandbox.auto_archive_minutes = request.auto_archive_minutes;
        sandbox.auto_delete_minutes = request.auto_delete_minutes;
        sandbox.dedicated_only = request.dedicated_only;
        sandbox.touch();
        if network_changed {
            self.enqueue(
                &mut sandbox,
                JobType::UpdateSandboxNetworkSettings,
                SandboxState::Started,
            )
            .await?;
        } else {
            self.save(&mut sandbox).await?;
        }
        info!(sandbox_id = %sandbox.id, pool_id = %pool.id, name = %sandbox.name, "sandbox claimed from warm pool");
        Ok(Some(sandbox))
    }

    /// Top every pool up to its size. Broken members are destroyed and
    /// surplus ones trimmed. Returns how many members were created.
    pub async fn replenish_pools(&self) -> Result<usize> {
        let mut created = 0;
        for pool in self.pools.list_pools().await? {
            match self.replenish_pool(pool).await {
                Ok(n) => created += n,
                Err(e) => warn!(error = %e, "warm pool replenishment stopped"),
            }
        }
        Ok(created)
    }

    async fn replenish_pool(&self, mut pool: WarmPool) -> Result<usize> {
        let mut live = Vec::new();
        for member in self.store.list_pool_members(&pool.id).await? {
            if member.desired_state == DesiredState::Destroyed {
                continue;
            }
            if matches!(member.state, SandboxState::Error | SandboxState::BuildFailed) {
                debug!(pool_id = %pool.id, sandbox_id = %member.id, "discarding broken pool member");
                self.destroy(&member.id).await?;
                continue;
            }
            live.push(member);
        }

        let size = pool.size as usize;
        for surplus in live.iter().skip(size).filter(|m| is_idle(m)) {
            self.destroy(&surplus.id).await?;
        }

        let mut created = 0;
        let mut error_reason = None;
        for _ in live.len()..size {
            match self.create_cold(pool.member_request(), Some(pool.id.clone())).await {
                Ok(_) => created += 1,
                Err(e) => {
                    warn!(pool_id = %pool.id, error = %e, "failed to create pool member");
                    error_reason = Some(e.to_string());
                    break;
                },
            }
        }
        if pool.error_reason != error_reason {
            pool.error_reason = error_reason;
            pool.updated_at_ms = corral_common::now_ms();
            self.pools.upsert_pool(&pool).await?;
        }
        if created > 0 {
            info!(pool_id = %pool.id, created, "warm pool replenished");
        }
        Ok(created)
    }
}

/// Started and meant to stay started: ready to hand out.
fn is_idle(sandbox: &Sandbox) -> bool {
    sandbox.state == SandboxState::Started && sandbox.desired_state == DesiredState::Started
}
