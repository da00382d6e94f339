//! Regions and runners: capacity accounting, availability scoring,
//! action-load tracking, health polling and the runner allocator.

pub mod action_load;
pub mod allocator;
pub mod error;
pub mod health;
pub mod registry;
pub mod scoring;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use {
    action_load::{ActionLoad, LoadAction},
    allocator::{PlacementRequest, RunnerAllocator},
    error::{AllocationError, Error, Result},
    health::RunnerHealthMonitor,
    registry::{RunnerRegistration, RunnerRegistry},
    store::RegistryStore,
    store_memory::InMemoryRegistryStore,
    store_sqlite::SqliteRegistryStore,
    types::{HealthMode, PenaltyRule, Region, Runner, RunnerClass, RunnerState, Usage},
};

/// Run database migrations for regions and runners.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
