//! Administrative operations on regions and runners.

use std::sync::Arc;

use {
    corral_common::Resources,
    secrecy::Secret,
    tracing::info,
};

use crate::{
    Error, Result,
    store::RegistryStore,
    types::{HealthMode, Region, Runner, RunnerClass, RunnerState},
};

/// Parameters for registering a runner.
#[derive(Debug, Clone)]
pub struct RunnerRegistration {
    pub id: String,
    pub region: String,
    pub class: RunnerClass,
    pub capacity: Resources,
    pub api_url: String,
    pub api_key: Secret<String>,
    pub organization_id: Option<String>,
    pub health_mode: HealthMode,
}

pub struct RunnerRegistry {
    store: Arc<dyn RegistryStore>,
}

impl RunnerRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub async fn upsert_region(&self, region: Region) -> Result<Region> {
        self.store.upsert_region(&region).await?;
        Ok(region)
    }

    /// Register a runner in an existing region. It starts `initializing`
    /// and becomes schedulable after its first successful health report.
    pub async fn register(&self, reg: RunnerRegistration) -> Result<Runner> {
        if self.store.get_region(&reg.region).await?.is_none() {
            return Err(Error::RegionNotFound(reg.region));
        }
        let mut runner = Runner::new(reg.id, reg.region, reg.class, reg.capacity);
        runner.api_url = reg.api_url;
        runner.api_key = reg.api_key;
        runner.organization_id = reg.organization_id;
        runner.health_mode = reg.health_mode;
        self.store.insert_runner(&runner).await?;
        info!(runner_id = %runner.id, region = %runner.region, class = %runner.class, "runner registered");
        Ok(runner)
    }

    pub async fn get(&self, id: &str) -> Result<Runner> {
        self.store
            .get_runner(id)
            .await?
            .ok_or_else(|| Error::runner_not_found(id))
    }

    pub async fn list(&self) -> Result<Vec<Runner>> {
        self.store.list_runners().await
    }

    pub async fn list_in_region(&self, region: &str) -> Result<Vec<Runner>> {
        Ok(self
            .store
            .list_runners()
            .await?
            .into_iter()
            .filter(|r| r.region == region)
            .collect())
    }

    /// Stop placing new sandboxes on the runner. Hosted sandboxes keep running.
    pub async fn drain(&self, id: &str) -> Result<Runner> {
        self.update(id, |r| r.draining = true).await
    }

    pub async fn undrain(&self, id: &str) -> Result<Runner> {
        self.update(id, |r| r.draining = false).await
    }

    pub async fn disable(&self, id: &str) -> Result<Runner> {
        self.update(id, |r| r.state = RunnerState::Disabled).await
    }

    /// Re-enable a disabled runner; the next health check promotes it.
    pub async fn enable(&self, id: &str) -> Result<Runner> {
        self.update(id, |r| {
            if r.state == RunnerState::Disabled {
                r.state = RunnerState::Initializing;
            }
        })
        .await
    }

    pub async fn decommission(&self, id: &str) -> Result<Runner> {
        self.update(id, |r| {
            r.state = RunnerState::Decommissioned;
            r.draining = true;
            r.availability_score = 0;
        })
        .await
    }

    /// Delete a runner. It must be draining and host no live sandboxes; the
    /// caller supplies that count since sandboxes live in another store.
    pub async fn remove(&self, id: &str, hosted_sandboxes: usize) -> Result<()> {
        let runner = self.get(id).await?;
        if !runner.draining {
            return Err(Error::conflict(format!(
                "runner {id} must be draining before removal"
            )));
        }
        if hosted_sandboxes > 0 {
            return Err(Error::conflict(format!(
                "runner {id} still hosts {hosted_sandboxes} sandbox(es)"
            )));
        }
        self.store.delete_runner(id).await?;
        info!(runner_id = id, "runner removed");
        Ok(())
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut Runner)) -> Result<Runner> {
        let mut runner = self.get(id).await?;
        f(&mut runner);
        self.store.update_runner(&runner).await?;
        info!(runner_id = id, state = ?runner.state, draining = runner.draining, "runner updated");
        Ok(runner)
    }
}
