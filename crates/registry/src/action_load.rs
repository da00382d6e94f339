//! Action load: a runner accrues points while it works on lifecycle actions
//! and sheds them when the action resolves. The derived penalty pushes new
//! placements towards quieter runners.

use std::sync::Arc;

use {corral_config::ActionLoadConfig, tracing::debug};

use crate::{Result, store::RegistryStore, types::PenaltyRule};

/// Lifecycle action a runner is busy with, weighted by how heavy it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAction {
    Destroy,
    Stop,
    BuildSnapshot,
    PullSnapshot,
    Restore,
    StartFromStopped,
    Start,
}

pub struct ActionLoad {
    store: Arc<dyn RegistryStore>,
    config: ActionLoadConfig,
}

impl ActionLoad {
    pub fn new(store: Arc<dyn RegistryStore>, config: ActionLoadConfig) -> Self {
        Self { store, config }
    }

    pub fn points(&self, action: LoadAction) -> u32 {
        let c = &self.config;
        match action {
            LoadAction::Destroy => c.any_destroyed,
            LoadAction::Stop => c.started_stopped,
            LoadAction::BuildSnapshot => c.building_snapshot_started,
            LoadAction::PullSnapshot => c.pulling_snapshot_started,
            LoadAction::Restore => c.restoring_started,
            LoadAction::StartFromStopped => c.stopped_started,
            LoadAction::Start => c.any_started,
        }
    }

    pub fn rule(&self) -> PenaltyRule {
        PenaltyRule {
            divisor: self.config.penalty_divisor,
            maximum: self.config.penalty_maximum,
        }
    }

    /// Charge `action` to `runner_id`.
    pub async fn begin(&self, runner_id: &str, action: LoadAction) -> Result<()> {
        self.adjust(runner_id, action, 1).await
    }

    /// Refund the points charged by [`ActionLoad::begin`].
    pub async fn finish(&self, runner_id: &str, action: LoadAction) -> Result<()> {
        self.adjust(runner_id, action, -1).await
    }

    async fn adjust(&self, runner_id: &str, action: LoadAction, sign: i64) -> Result<()> {
        let points = self.points(action);
        if points == 0 {
            return Ok(());
        }
        let (total, penalty) = self
            .store
            .adjust_action_load(runner_id, sign * i64::from(points), self.rule())
            .await?;
        debug!(runner_id, ?action, total, penalty, "action load adjusted");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{store_memory::InMemoryRegistryStore, types::{Runner, RunnerClass}},
        corral_common::Resources,
    };

    #[tokio::test]
    async fn begin_and_finish_balance() {
        let store = Arc::new(InMemoryRegistryStore::new());
        store
            .insert_runner(&Runner::new("r1", "eu", RunnerClass::Linux, Resources::new(4, 4, 4)))
            .await
            .unwrap();
        let load = ActionLoad::new(store.clone(), ActionLoadConfig::default());

        load.begin("r1", LoadAction::BuildSnapshot).await.unwrap();
        load.begin("r1", LoadAction::Start).await.unwrap();
        let r = store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(r.action_load_points, 12);
        assert_eq!(r.action_load_penalty, 6);

        load.finish("r1", LoadAction::BuildSnapshot).await.unwrap();
        load.finish("r1", LoadAction::Start).await.unwrap();
        let r = store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(r.action_load_points, 0);
        assert_eq!(r.action_load_penalty, 0);
    }

    #[test]
    fn build_outweighs_pull_outweighs_restore_outweighs_start() {
        let load = ActionLoad::new(Arc::new(InMemoryRegistryStore::new()), ActionLoadConfig::default());
        assert!(load.points(LoadAction::BuildSnapshot) > load.points(LoadAction::PullSnapshot));
        assert!(load.points(LoadAction::PullSnapshot) > load.points(LoadAction::Restore));
        assert!(load.points(LoadAction::Restore) > load.points(LoadAction::Start));
    }
}
