//! Sandboxes: the state machine and its reconciler, the job dispatcher,
//! warm pools, backups and the periodic sweeps that keep everything moving.

pub mod allocations;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod reconcile;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod sweeps;
pub mod types;
pub mod warm_pool;

pub use {
    allocations::{AllocationAudit, expected_allocation},
    dispatcher::{DispatchWorker, Dispatcher, StaleJobReaper},
    error::{Error, Result},
    manager::{SandboxManager, Services},
    reconcile::{Facts, Step, plan},
    store::{SandboxStore, WarmPoolStore},
    store_memory::{InMemorySandboxStore, InMemoryWarmPoolStore},
    store_sqlite::{SqliteSandboxStore, SqliteWarmPoolStore},
    sweeps::{Sweep, SweepKind},
    types::{BackupState, DesiredState, NewSandbox, Sandbox, SandboxState},
    warm_pool::{PoolKey, WarmPool, WarmPoolReplenisher},
};

/// Run database migrations for sandboxes and warm pools.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
