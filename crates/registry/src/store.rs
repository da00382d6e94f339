//! Persistence for regions and runners.

use async_trait::async_trait;

use {
    crate::{
        Result,
        types::{PenaltyRule, Region, Runner},
    },
    corral_common::Resources,
};

/// Regions and runners.
///
/// `update_runner` never touches the allocation or action-load counters:
/// those change only through `try_reserve`, `release` and
/// `adjust_action_load`, so a health update cannot clobber a concurrent
/// reservation.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn upsert_region(&self, region: &Region) -> Result<()>;
    async fn get_region(&self, id: &str) -> Result<Option<Region>>;
    async fn list_regions(&self) -> Result<Vec<Region>>;

    /// Fails with `Conflict` if the id is taken.
    async fn insert_runner(&self, runner: &Runner) -> Result<()>;
    async fn update_runner(&self, runner: &Runner) -> Result<()>;
    async fn get_runner(&self, id: &str) -> Result<Option<Runner>>;
    async fn list_runners(&self) -> Result<Vec<Runner>>;
    async fn delete_runner(&self, id: &str) -> Result<()>;

    /// Add `amount` to the runner's allocated counters if, and only if, every
    /// dimension stays within capacity. Returns whether it was reserved.
    async fn try_reserve(&self, runner_id: &str, amount: &Resources) -> Result<bool>;

    /// Subtract `amount` from the allocated counters, flooring at zero.
    async fn release(&self, runner_id: &str, amount: &Resources) -> Result<()>;

    /// Overwrite the allocated counters with `allocated` while they still
    /// read `observed`. Returns whether they were replaced.
    async fn reset_allocated(
        &self,
        runner_id: &str,
        observed: &Resources,
        allocated: &Resources,
    ) -> Result<bool>;

    /// Add `delta` action-load points (flooring at zero) and recompute the
    /// penalty. Returns the new `(points, penalty)`.
    async fn adjust_action_load(
        &self,
        runner_id: &str,
        delta: i64,
        rule: PenaltyRule,
    ) -> Result<(u32, u32)>;
}
