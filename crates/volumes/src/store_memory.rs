//! In-memory disk and snapshot stores.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Error, Result,
    disk::{Disk, DiskState},
    snapshot::{Snapshot, SnapshotState},
    store::{DiskStore, SnapshotStore},
};

fn by_age<T>(mut items: Vec<T>, created: impl Fn(&T) -> (u64, String)) -> Vec<T> {
    items.sort_by_key(created);
    items
}

#[derive(Default)]
pub struct InMemoryDiskStore {
    disks: Mutex<HashMap<String, Disk>>,
}

impl InMemoryDiskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Disk>) -> R) -> R {
        let mut disks = self.disks.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut disks)
    }
}

#[async_trait]
impl DiskStore for InMemoryDiskStore {
    async fn insert(&self, disk: &Disk) -> Result<()> {
        self.with(|disks| {
            let taken = disks.values().any(|d| {
                d.organization_id == disk.organization_id
                    && d.name == disk.name
                    && d.state != DiskState::Deleted
            });
            if taken {
                return Err(Error::conflict(format!(
                    "disk with name {} already exists",
                    disk.name
                )));
            }
            disks.insert(disk.id.clone(), disk.clone());
            Ok(())
        })
    }

    async fn update(&self, disk: &Disk) -> Result<()> {
        self.with(|disks| match disks.get_mut(&disk.id) {
            Some(existing) => {
                *existing = disk.clone();
                Ok(())
            },
            None => Err(Error::DiskNotFound(disk.id.clone())),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Disk>> {
        Ok(self.with(|disks| disks.get(id).cloned()))
    }

    async fn list(&self, organization_id: &str) -> Result<Vec<Disk>> {
        let disks = self.with(|disks| {
            disks
                .values()
                .filter(|d| d.organization_id == organization_id && d.state != DiskState::Deleted)
                .cloned()
                .collect()
        });
        Ok(by_age(disks, |d| (d.created_at_ms, d.id.clone())))
    }

    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Disk>> {
        Ok(self.with(|disks| {
            disks
                .values()
                .find(|d| {
                    d.organization_id == organization_id
                        && d.name == name
                        && d.state != DiskState::Deleted
                })
                .cloned()
        }))
    }

    async fn list_attached_to(&self, sandbox_id: &str) -> Result<Vec<Disk>> {
        let disks = self.with(|disks| {
            disks
                .values()
                .filter(|d| d.sandbox_id.as_deref() == Some(sandbox_id))
                .cloned()
                .collect()
        });
        Ok(by_age(disks, |d| (d.created_at_ms, d.id.clone())))
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Snapshot>) -> R) -> R {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut snapshots)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        self.with(|snapshots| {
            let taken = snapshots.values().any(|s| {
                s.organization_id == snapshot.organization_id && s.name == snapshot.name
            });
            if taken {
                return Err(Error::conflict(format!(
                    "snapshot with name {} already exists",
                    snapshot.name
                )));
            }
            snapshots.insert(snapshot.id.clone(), snapshot.clone());
            Ok(())
        })
    }

    async fn update(&self, snapshot: &Snapshot) -> Result<()> {
        self.with(|snapshots| match snapshots.get_mut(&snapshot.id) {
            Some(existing) => {
                *existing = snapshot.clone();
                Ok(())
            },
            None => Err(Error::SnapshotNotFound(snapshot.id.clone())),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.with(|snapshots| snapshots.get(id).cloned()))
    }

    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Snapshot>> {
        Ok(self.with(|snapshots| {
            snapshots
                .values()
                .find(|s| s.organization_id == organization_id && s.name == name)
                .cloned()
        }))
    }

    async fn list(&self, organization_id: &str) -> Result<Vec<Snapshot>> {
        let snapshots = self.with(|snapshots| {
            snapshots
                .values()
                .filter(|s| s.organization_id == organization_id)
                .cloned()
                .collect()
        });
        Ok(by_age(snapshots, |s| (s.created_at_ms, s.id.clone())))
    }

    async fn list_in_states(&self, states: &[SnapshotState]) -> Result<Vec<Snapshot>> {
        let snapshots = self.with(|snapshots| {
            snapshots
                .values()
                .filter(|s| states.contains(&s.state))
                .cloned()
                .collect()
        });
        Ok(by_age(snapshots, |s| (s.created_at_ms, s.id.clone())))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.with(|snapshots| {
            snapshots
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::snapshot::NewSnapshot};

    #[tokio::test]
    async fn disk_names_free_up_after_deletion() {
        let store = InMemoryDiskStore::new();
        let mut first = Disk::new("org", "data", 10);
        store.insert(&first).await.unwrap();
        assert!(matches!(
            store.insert(&Disk::new("org", "data", 10)).await,
            Err(Error::Conflict(_))
        ));
        store.insert(&Disk::new("other-org", "data", 10)).await.unwrap();

        first.state = DiskState::Deleted;
        store.update(&first).await.unwrap();
        store.insert(&Disk::new("org", "data", 20)).await.unwrap();
        assert_eq!(store.list("org").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_states_filter() {
        let store = InMemorySnapshotStore::new();
        let mut a = NewSnapshot::new("org", "a", "img:a").into_snapshot();
        a.state = SnapshotState::Active;
        let b = NewSnapshot::new("org", "b", "img:b").into_snapshot();
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let pending = store
            .list_in_states(&SnapshotState::IN_PIPELINE)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        store.delete(&b.id).await.unwrap();
        assert!(store.get(&b.id).await.unwrap().is_none());
    }
}
