//! Runner health.
//!
//! Polled runners are probed with a bounded number of attempts; a runner that
//! fails them all is marked unresponsive and scores 0. Heartbeat runners push
//! their reports and go unresponsive once the latest report is stale.
//! Decommissioned runners are never touched.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    corral_common::{Tick, now_ms},
    corral_config::{HealthConfig, ScoringConfig},
    corral_runner_client::{HealthReport, RunnerApi},
    futures::future::join_all,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    scoring::availability_score,
    store::RegistryStore,
    types::{HealthMode, Runner, RunnerState, Usage},
};

pub struct RunnerHealthMonitor {
    store: Arc<dyn RegistryStore>,
    api: Arc<dyn RunnerApi>,
    health: HealthConfig,
    scoring: ScoringConfig,
}

impl RunnerHealthMonitor {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        api: Arc<dyn RunnerApi>,
        health: HealthConfig,
        scoring: ScoringConfig,
    ) -> Self {
        Self {
            store,
            api,
            health,
            scoring,
        }
    }

    /// Check every runner concurrently. Returns how many are ready afterwards.
    pub async fn check_all(&self) -> Result<usize> {
        let runners = self.store.list_runners().await?;
        let results = join_all(
            runners
                .iter()
                .filter(|r| r.state != RunnerState::Decommissioned)
                .map(|r| self.check_runner(r)),
        )
        .await;

        let mut ready = 0;
        for result in results {
            match result {
                Ok(RunnerState::Ready) => ready += 1,
                Ok(_) => {},
                Err(e) => warn!(error = %e, "runner health check failed to persist"),
            }
        }
        Ok(ready)
    }

    /// Check one runner and persist the outcome.
    pub async fn check_runner(&self, runner: &Runner) -> Result<RunnerState> {
        if runner.state == RunnerState::Decommissioned {
            return Ok(runner.state);
        }
        let mut updated = runner.clone();
        match runner.health_mode {
            HealthMode::Poll => match self.probe(runner).await {
                Ok(report) => self.apply_report(&mut updated, &report),
                Err(reason) => Self::mark_unresponsive(&mut updated, &reason),
            },
            HealthMode::Heartbeat => {
                let stale_after_ms = self.health.stale_after_secs * 1_000;
                let fresh = runner
                    .last_heartbeat_ms
                    .is_some_and(|at| now_ms().saturating_sub(at) <= stale_after_ms);
                if !fresh {
                    Self::mark_unresponsive(&mut updated, "heartbeat is stale");
                }
            },
        }
        updated.last_checked_ms = Some(now_ms());
        self.store.update_runner(&updated).await?;
        Ok(updated.state)
    }

    /// Store a report pushed by a heartbeat runner.
    pub async fn record_heartbeat(&self, runner_id: &str, report: &HealthReport) -> Result<()> {
        let mut runner = self
            .store
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| Error::runner_not_found(runner_id))?;
        if runner.state == RunnerState::Decommissioned {
            return Ok(());
        }
        self.apply_report(&mut runner, report);
        runner.last_heartbeat_ms = Some(now_ms());
        self.store.update_runner(&runner).await
    }

    async fn probe(&self, runner: &Runner) -> std::result::Result<HealthReport, String> {
        let target = runner.target();
        let delays = &self.health.retry_delays_ms;
        let mut last_error = String::new();

        for attempt in 0..=delays.len() {
            match tokio::time::timeout(self.health.timeout(), self.api.health(&target)).await {
                Ok(Ok(report)) => return Ok(report),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {}ms", self.health.timeout_ms),
            }
            debug!(runner_id = %runner.id, attempt, error = %last_error, "health probe failed");
            if let Some(delay) = delays.get(attempt) {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
        }
        Err(last_error)
    }

    fn apply_report(&self, runner: &mut Runner, report: &HealthReport) {
        runner.usage = Usage {
            cpu: report.cpu_usage,
            memory: report.memory_usage,
            disk: report.disk_usage,
        };
        if report.version.is_some() {
            runner.version.clone_from(&report.version);
        }
        runner.availability_score =
            availability_score(&runner.usage, &runner.capacity, &runner.allocated, &self.scoring);
        if matches!(
            runner.state,
            RunnerState::Initializing | RunnerState::Unresponsive
        ) {
            info!(runner_id = %runner.id, score = runner.availability_score, "runner ready");
            runner.state = RunnerState::Ready;
        }
    }

    fn mark_unresponsive(runner: &mut Runner, reason: &str) {
        if runner.state != RunnerState::Unresponsive {
            warn!(runner_id = %runner.id, reason, "runner unresponsive");
        }
        if runner.state != RunnerState::Disabled {
            runner.state = RunnerState::Unresponsive;
        }
        runner.availability_score = 0;
    }
}

#[async_trait]
impl Tick for RunnerHealthMonitor {
    fn name(&self) -> &'static str {
        "runner-health"
    }

    async fn tick(&self) {
        match self.check_all().await {
            Ok(ready) => debug!(ready, "runner health pass complete"),
            Err(e) => warn!(error = %e, "runner health pass failed"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{store_memory::InMemoryRegistryStore, types::RunnerClass},
        corral_common::Resources,
        corral_runner_client::ScriptedRunner,
    };

    struct Fixture {
        store: Arc<InMemoryRegistryStore>,
        api: Arc<ScriptedRunner>,
        monitor: RunnerHealthMonitor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRegistryStore::new());
        let api = Arc::new(ScriptedRunner::new());
        let health = HealthConfig {
            retry_delays_ms: vec![1, 1],
            timeout_ms: 50,
            ..HealthConfig::default()
        };
        let monitor =
            RunnerHealthMonitor::new(store.clone(), api.clone(), health, ScoringConfig::default());
        Fixture {
            store,
            api,
            monitor,
        }
    }

    fn runner(id: &str) -> Runner {
        Runner::new(id, "eu", RunnerClass::Linux, Resources::new(8, 32, 200))
    }

    #[tokio::test]
    async fn healthy_runner_becomes_ready_with_score() {
        let f = fixture();
        f.store.insert_runner(&runner("r1")).await.unwrap();
        f.api.set_health("r1", HealthReport {
            cpu_usage: 10.0,
            memory_usage: 20.0,
            disk_usage: 5.0,
            ..HealthReport::default()
        });

        assert_eq!(f.monitor.check_all().await.unwrap(), 1);
        let r = f.store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(r.state, RunnerState::Ready);
        assert!(r.availability_score > 0);
        assert!(r.last_checked_ms.is_some());
    }

    #[tokio::test]
    async fn failing_runner_is_retried_then_unresponsive() {
        let f = fixture();
        let mut r = runner("r1");
        r.state = RunnerState::Ready;
        r.availability_score = 80;
        f.store.insert_runner(&r).await.unwrap();
        f.api.set_unhealthy("r1", "connection refused");

        let state = f.monitor.check_runner(&r).await.unwrap();
        assert_eq!(state, RunnerState::Unresponsive);
        assert_eq!(f.api.count("health"), 3);
        let stored = f.store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(stored.availability_score, 0);
    }

    #[tokio::test]
    async fn transient_probe_failure_recovers_within_attempts() {
        let f = fixture();
        f.store.insert_runner(&runner("r1")).await.unwrap();
        f.api.fail_next("health", "reset by peer");

        let r = f.store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(f.monitor.check_runner(&r).await.unwrap(), RunnerState::Ready);
        assert_eq!(f.api.count("health"), 2);
    }

    #[tokio::test]
    async fn probe_timeout_counts_as_failure() {
        let f = fixture();
        f.store.insert_runner(&runner("r1")).await.unwrap();
        f.api.delay("health", Duration::from_millis(200));

        let r = f.store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(
            f.monitor.check_runner(&r).await.unwrap(),
            RunnerState::Unresponsive
        );
    }

    #[tokio::test]
    async fn decommissioned_runner_is_skipped() {
        let f = fixture();
        let mut r = runner("r1");
        r.state = RunnerState::Decommissioned;
        f.store.insert_runner(&r).await.unwrap();

        f.monitor.check_all().await.unwrap();
        assert_eq!(f.api.count("health"), 0);
    }

    #[tokio::test]
    async fn stale_heartbeat_marks_unresponsive() {
        let f = fixture();
        let mut r = runner("r1");
        r.health_mode = HealthMode::Heartbeat;
        r.state = RunnerState::Ready;
        r.last_heartbeat_ms = Some(now_ms() - 120_000);
        f.store.insert_runner(&r).await.unwrap();

        assert_eq!(
            f.monitor.check_runner(&r).await.unwrap(),
            RunnerState::Unresponsive
        );
        assert_eq!(f.api.count("health"), 0);

        f.monitor
            .record_heartbeat("r1", &HealthReport::default())
            .await
            .unwrap();
        let r = f.store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(r.state, RunnerState::Ready);
        assert_eq!(
            f.monitor.check_runner(&r).await.unwrap(),
            RunnerState::Ready
        );
    }
}
