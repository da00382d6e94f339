//! Persistence for disks and snapshots.

use async_trait::async_trait;

use crate::{
    Result,
    disk::Disk,
    snapshot::{Snapshot, SnapshotState},
};

#[async_trait]
pub trait DiskStore: Send + Sync {
    /// Fails with `Conflict` if the organization already has a live disk of that name.
    async fn insert(&self, disk: &Disk) -> Result<()>;
    async fn update(&self, disk: &Disk) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Disk>>;
    /// Disks of an organization that are not deleted, oldest first.
    async fn list(&self, organization_id: &str) -> Result<Vec<Disk>>;
    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Disk>>;
    async fn list_attached_to(&self, sandbox_id: &str) -> Result<Vec<Disk>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fails with `Conflict` if the organization already has a snapshot of that name.
    async fn insert(&self, snapshot: &Snapshot) -> Result<()>;
    async fn update(&self, snapshot: &Snapshot) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Snapshot>>;
    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Snapshot>>;
    async fn list(&self, organization_id: &str) -> Result<Vec<Snapshot>>;
    async fn list_in_states(&self, states: &[SnapshotState]) -> Result<Vec<Snapshot>>;
    async fn delete(&self, id: &str) -> Result<()>;
}
