//! Persistent disks and sandbox images: their state machines, stores and
//! the snapshot pipeline tick.

pub mod disk;
pub mod disks;
pub mod error;
pub mod snapshot;
pub mod snapshots;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    disk::{Disk, DiskState},
    disks::DiskManager,
    error::{Error, Result},
    snapshot::{DEFAULT_ENTRYPOINT, NewSnapshot, Snapshot, SnapshotState},
    snapshots::SnapshotPipeline,
    store::{DiskStore, SnapshotStore},
    store_memory::{InMemoryDiskStore, InMemorySnapshotStore},
    store_sqlite::{SqliteDiskStore, SqliteSnapshotStore},
};

/// Run database migrations for disks and snapshots.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
