//! Persistence for sandboxes and warm pools.

use async_trait::async_trait;

use crate::{Result, types::Sandbox, warm_pool::WarmPool};

#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Fails with `Conflict` if the organization already has a live sandbox of that name.
    async fn insert(&self, sandbox: &Sandbox) -> Result<()>;
    async fn update(&self, sandbox: &Sandbox) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Sandbox>>;
    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Sandbox>>;
    /// Live sandboxes of an organization, oldest first.
    async fn list(&self, organization_id: &str) -> Result<Vec<Sandbox>>;
    /// Live sandboxes placed on a runner.
    async fn list_on_runner(&self, runner_id: &str) -> Result<Vec<Sandbox>>;
    /// Up to `limit` live sandboxes with ids greater than `after`, ordered by id.
    async fn list_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<Sandbox>>;
    /// Live sandboxes idling in a warm pool, oldest first.
    async fn list_pool_members(&self, pool_id: &str) -> Result<Vec<Sandbox>>;
}

#[async_trait]
pub trait WarmPoolStore: Send + Sync {
    async fn upsert_pool(&self, pool: &WarmPool) -> Result<()>;
    async fn get_pool(&self, id: &str) -> Result<Option<WarmPool>>;
    async fn list_pools(&self) -> Result<Vec<WarmPool>>;
    async fn list_pools_for(&self, organization_id: &str) -> Result<Vec<WarmPool>>;
    async fn delete_pool(&self, id: &str) -> Result<()>;
}
