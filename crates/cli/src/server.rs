//! Wiring of stores and services over one SQLite database, and the
//! long-running `serve` loop.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Context,
    corral_common::{LockProvider, PeriodicTask, SqliteLocks, Tick},
    corral_config::CorralConfig,
    corral_jobs::{JobStore, SqliteJobStore},
    corral_registry::{RegistryStore, RunnerHealthMonitor, RunnerRegistry, SqliteRegistryStore},
    corral_runner_client::{HttpRunnerApi, RunnerApi},
    corral_sandbox::{
        AllocationAudit, DispatchWorker, Dispatcher, SandboxManager, Services, SqliteSandboxStore,
        SqliteWarmPoolStore, StaleJobReaper, Sweep, SweepKind, WarmPoolReplenisher,
    },
    corral_volumes::{DiskManager, SnapshotPipeline, SqliteDiskStore, SqliteSnapshotStore},
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
    tracing::info,
};

const STALE_JOB_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Drift must survive two passes this far apart before it is repaired.
const ALLOCATION_AUDIT_INTERVAL: Duration = Duration::from_secs(300);

pub async fn open_pool(config: &CorralConfig) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections.max(1))
        .connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    Ok(pool)
}

/// Apply every crate's migrations, shared lease table first.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    corral_common::run_migrations(pool).await?;
    corral_registry::run_migrations(pool).await?;
    corral_jobs::run_migrations(pool).await?;
    corral_volumes::run_migrations(pool).await?;
    corral_sandbox::run_migrations(pool).await?;
    Ok(())
}

pub struct ControlPlane {
    pub config: CorralConfig,
    pub registry: Arc<dyn RegistryStore>,
    pub api: Arc<dyn RunnerApi>,
    pub snapshots: Arc<SnapshotPipeline>,
    pub manager: Arc<SandboxManager>,
    pub dispatcher: Arc<Dispatcher>,
    pool: SqlitePool,
}

impl ControlPlane {
    /// Open the database, migrate it and build every service on top.
    pub async fn open(config: CorralConfig) -> anyhow::Result<Self> {
        let pool = open_pool(&config).await?;
        migrate(&pool).await?;

        let registry: Arc<dyn RegistryStore> =
            Arc::new(SqliteRegistryStore::with_pool(pool.clone()));
        let jobs: Arc<dyn JobStore> = Arc::new(SqliteJobStore::with_pool(pool.clone()));
        let locks: Arc<dyn LockProvider> = Arc::new(SqliteLocks::with_pool(pool.clone()));
        let timeouts = &config.dispatcher.timeouts;
        let longest = [
            timeouts.default_secs,
            timeouts.build_snapshot_secs,
            timeouts.pull_snapshot_secs,
            timeouts.create_backup_secs,
            timeouts.create_sandbox_snapshot_secs,
        ]
        .into_iter()
        .max()
        .unwrap_or(timeouts.default_secs);
        let api: Arc<dyn RunnerApi> = Arc::new(HttpRunnerApi::new(Duration::from_secs(longest))?);

        let disks = Arc::new(DiskManager::new(
            Arc::new(SqliteDiskStore::with_pool(pool.clone())),
            Arc::clone(&registry),
            Arc::clone(&api),
            Arc::clone(&locks),
            config.locks.clone(),
        ));
        let snapshots = Arc::new(SnapshotPipeline::new(
            Arc::new(SqliteSnapshotStore::with_pool(pool.clone())),
            Arc::clone(&jobs),
            Arc::clone(&registry),
            Arc::clone(&api),
            Arc::clone(&locks),
            config.snapshots.clone(),
            config.locks.clone(),
        ));
        let manager = Arc::new(SandboxManager::new(
            Services {
                store: Arc::new(SqliteSandboxStore::with_pool(pool.clone())),
                pools: Arc::new(SqliteWarmPoolStore::with_pool(pool.clone())),
                jobs: Arc::clone(&jobs),
                registry: Arc::clone(&registry),
                api: Arc::clone(&api),
                disks,
                snapshots: Arc::clone(&snapshots),
                locks,
            },
            &config,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            jobs,
            manager.clone(),
            snapshots.clone(),
            Arc::clone(&registry),
            &config,
        ));

        Ok(Self {
            config,
            registry,
            api,
            snapshots,
            manager,
            dispatcher,
            pool,
        })
    }

    pub fn runners(&self) -> RunnerRegistry {
        RunnerRegistry::new(Arc::clone(&self.registry))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[derive(Default)]
struct Tasks(Vec<Arc<PeriodicTask>>);

impl Tasks {
    fn spawn(&mut self, task: Arc<dyn Tick>, interval: Duration) -> Arc<PeriodicTask> {
        let handle = Arc::new(PeriodicTask::spawn(task, interval));
        self.0.push(Arc::clone(&handle));
        handle
    }
}

/// Run workers and background loops until Ctrl-C.
pub async fn serve(plane: ControlPlane) -> anyhow::Result<()> {
    let config = plane.config.clone();
    let mut tasks = Tasks::default();

    for _ in 0..config.dispatcher.workers.max(1) {
        tasks.spawn(
            Arc::new(DispatchWorker::new(plane.dispatcher.clone())),
            config.dispatcher.poll_interval(),
        );
    }
    tasks.spawn(
        Arc::new(StaleJobReaper::new(plane.dispatcher.clone())),
        STALE_JOB_CHECK_INTERVAL,
    );
    tasks.spawn(
        Arc::new(RunnerHealthMonitor::new(
            Arc::clone(&plane.registry),
            Arc::clone(&plane.api),
            config.health.clone(),
            config.scoring.clone(),
        )),
        config.health.interval(),
    );
    tasks.spawn(
        Arc::new(AllocationAudit::new(
            Arc::clone(plane.manager.store()),
            Arc::clone(&plane.registry),
        )),
        ALLOCATION_AUDIT_INTERVAL,
    );
    tasks.spawn(plane.snapshots.clone(), config.snapshots.interval());
    for kind in SweepKind::ALL {
        let interval = match kind {
            SweepKind::Backup => config.backups.interval(),
            _ => config.sweeps.interval(),
        };
        tasks.spawn(
            Arc::new(Sweep::new(kind, plane.manager.clone(), config.sweeps.page_size)),
            interval,
        );
    }
    let replenisher = tasks.spawn(
        Arc::new(WarmPoolReplenisher::new(plane.manager.clone())),
        config.warm_pool.interval(),
    );

    // A claimed pool member is replaced right away instead of on the next interval.
    let signal = plane.manager.replenish_signal();
    let forwarder = tokio::spawn(async move {
        loop {
            signal.notified().await;
            replenisher.wake();
        }
    });

    info!(
        workers = config.dispatcher.workers,
        tasks = tasks.0.len(),
        "control plane running"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    forwarder.abort();
    for task in tasks.0 {
        task.stop().await;
    }
    plane.close().await;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_migrates_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CorralConfig::default();
        config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("c.db").display());

        let plane = ControlPlane::open(config.clone()).await.unwrap();
        assert!(plane.runners().list().await.unwrap().is_empty());
        plane.close().await;

        // Migrating twice is a no-op.
        let pool = open_pool(&config).await.unwrap();
        migrate(&pool).await.unwrap();
    }
}
