//! In-memory registry store.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use {
    crate::{
        Error, Result,
        store::RegistryStore,
        types::{PenaltyRule, Region, Runner},
    },
    corral_common::Resources,
};

#[derive(Default)]
struct Inner {
    regions: HashMap<String, Region>,
    runners: HashMap<String, Runner>,
}

#[derive(Default)]
pub struct InMemoryRegistryStore {
    inner: Mutex<Inner>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn upsert_region(&self, region: &Region) -> Result<()> {
        self.with(|i| i.regions.insert(region.id.clone(), region.clone()));
        Ok(())
    }

    async fn get_region(&self, id: &str) -> Result<Option<Region>> {
        Ok(self.with(|i| i.regions.get(id).cloned()))
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        let mut regions: Vec<_> = self.with(|i| i.regions.values().cloned().collect());
        regions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(regions)
    }

    async fn insert_runner(&self, runner: &Runner) -> Result<()> {
        self.with(|i| {
            if i.runners.contains_key(&runner.id) {
                return Err(Error::conflict(format!("runner {} already exists", runner.id)));
            }
            i.runners.insert(runner.id.clone(), runner.clone());
            Ok(())
        })
    }

    async fn update_runner(&self, runner: &Runner) -> Result<()> {
        self.with(|i| {
            let existing = i
                .runners
                .get_mut(&runner.id)
                .ok_or_else(|| Error::runner_not_found(&runner.id))?;
            let mut updated = runner.clone();
            updated.allocated = existing.allocated.clone();
            updated.action_load_points = existing.action_load_points;
            updated.action_load_penalty = existing.action_load_penalty;
            *existing = updated;
            Ok(())
        })
    }

    async fn get_runner(&self, id: &str) -> Result<Option<Runner>> {
        Ok(self.with(|i| i.runners.get(id).cloned()))
    }

    async fn list_runners(&self) -> Result<Vec<Runner>> {
        let mut runners: Vec<_> = self.with(|i| i.runners.values().cloned().collect());
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runners)
    }

    async fn delete_runner(&self, id: &str) -> Result<()> {
        self.with(|i| {
            i.runners
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::runner_not_found(id))
        })
    }

    async fn try_reserve(&self, runner_id: &str, amount: &Resources) -> Result<bool> {
        self.with(|i| {
            let runner = i
                .runners
                .get_mut(runner_id)
                .ok_or_else(|| Error::runner_not_found(runner_id))?;
            if !amount.fits_within(&runner.free()) {
                return Ok(false);
            }
            runner.allocated = runner.allocated.saturating_add(amount);
            Ok(true)
        })
    }

    async fn release(&self, runner_id: &str, amount: &Resources) -> Result<()> {
        self.with(|i| {
            let runner = i
                .runners
                .get_mut(runner_id)
                .ok_or_else(|| Error::runner_not_found(runner_id))?;
            runner.allocated = runner.allocated.saturating_sub(amount);
            Ok(())
        })
    }

    async fn reset_allocated(
        &self,
        runner_id: &str,
        observed: &Resources,
        allocated: &Resources,
    ) -> Result<bool> {
        self.with(|i| {
            let runner = i
                .runners
                .get_mut(runner_id)
                .ok_or_else(|| Error::runner_not_found(runner_id))?;
            if !runner.allocated.same_amount(observed) {
                return Ok(false);
            }
            runner.allocated = Resources {
                gpu_type: runner.allocated.gpu_type.take(),
                ..allocated.clone()
            };
            Ok(true)
        })
    }

    async fn adjust_action_load(
        &self,
        runner_id: &str,
        delta: i64,
        rule: PenaltyRule,
    ) -> Result<(u32, u32)> {
        self.with(|i| {
            let runner = i
                .runners
                .get_mut(runner_id)
                .ok_or_else(|| Error::runner_not_found(runner_id))?;
            let points = (i64::from(runner.action_load_points) + delta).clamp(0, i64::from(u32::MAX));
            runner.action_load_points = points as u32;
            runner.action_load_penalty = rule.penalty(runner.action_load_points);
            Ok((runner.action_load_points, runner.action_load_penalty))
        })
    }
}
