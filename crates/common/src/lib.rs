//! Shared error type, resource shapes, clocks, named lease locks and the
//! periodic task runner used across all corral crates.

pub mod error;
pub mod lock;
pub mod lock_memory;
pub mod lock_sqlite;
pub mod periodic;
pub mod resources;
pub mod time;

pub use {
    error::{Error, Result},
    lock::{
        LockGuard, LockProvider, acquire, disk_lock_key, sandbox_lock_key, snapshot_lock_key,
        try_acquire,
    },
    lock_memory::InMemoryLocks,
    lock_sqlite::SqliteLocks,
    periodic::{PeriodicTask, Tick},
    resources::Resources,
    time::now_ms,
};

/// Run database migrations for the shared lease table.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
