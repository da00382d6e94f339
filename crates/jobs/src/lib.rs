//! Jobs: the closed set of work items, their persistence with atomic claim,
//! and the failure classifier consulted when one fails.

pub mod error;
pub mod handler;
pub mod recovery;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use {
    error::{Error, Result},
    handler::{JobError, JobHandler, JobOutcome},
    recovery::{
        Classification, ErrorPayload, OperationKind, RecoveryType, SanitizedError, classify,
        classify_sanitized, normalize,
    },
    store::JobStore,
    store_memory::InMemoryJobStore,
    store_sqlite::SqliteJobStore,
    types::{Job, JobStatus, JobType, ResourceKind},
};

/// Run database migrations for the job table.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
