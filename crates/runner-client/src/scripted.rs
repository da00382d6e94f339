//! In-process runner that records calls and plays back scripted failures.
//! Used by tests across the workspace in place of a real runner agent.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use {
    crate::{
        BackupRequest, BuildSnapshotRequest, CopySandboxRequest, CreateSandboxRequest, DiskRequest,
        Error, ForkDiskRequest, HealthReport, NetworkSettings, PullSnapshotRequest, Result,
        RunnerApi, RunnerTarget, SandboxSnapshotRequest, SnapshotInfo,
    },
    corral_common::Resources,
};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCall {
    pub runner_id: String,
    /// Trait method name, e.g. `start_sandbox`.
    pub op: &'static str,
    /// Sandbox id, snapshot ref or disk id the call was about.
    pub subject: String,
}

enum Failure {
    Message(String),
    Status(u16, String),
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Self::Message(m) => Error::remote(m.clone()),
            Self::Status(status, body) => Error::Status {
                status: *status,
                body: body.clone(),
            },
        }
    }
}

#[derive(Default)]
struct Script {
    calls: Vec<RunnerCall>,
    next_failures: HashMap<&'static str, VecDeque<Failure>>,
    always_fail: HashMap<&'static str, Failure>,
    delays: HashMap<&'static str, Duration>,
    health: HashMap<String, std::result::Result<HealthReport, String>>,
    snapshot_info: HashMap<String, SnapshotInfo>,
}

#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<Script>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }

    /// Fail the next call of `op` with a plain message.
    pub fn fail_next(&self, op: &'static str, message: impl Into<String>) {
        self.with_script(|s| {
            s.next_failures
                .entry(op)
                .or_default()
                .push_back(Failure::Message(message.into()))
        });
    }

    /// Fail the next call of `op` with an HTTP status and body.
    pub fn fail_next_status(&self, op: &'static str, status: u16, body: impl Into<String>) {
        self.with_script(|s| {
            s.next_failures
                .entry(op)
                .or_default()
                .push_back(Failure::Status(status, body.into()))
        });
    }

    /// Fail every call of `op` until [`ScriptedRunner::clear_failures`].
    pub fn fail_always(&self, op: &'static str, message: impl Into<String>) {
        self.with_script(|s| {
            s.always_fail.insert(op, Failure::Message(message.into()));
        });
    }

    pub fn clear_failures(&self) {
        self.with_script(|s| {
            s.next_failures.clear();
            s.always_fail.clear();
        });
    }

    /// Make every call of `op` take `delay` before answering.
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.with_script(|s| {
            s.delays.insert(op, delay);
        });
    }

    pub fn set_health(&self, runner_id: &str, report: HealthReport) {
        self.with_script(|s| {
            s.health.insert(runner_id.to_string(), Ok(report));
        });
    }

    pub fn set_unhealthy(&self, runner_id: &str, message: impl Into<String>) {
        self.with_script(|s| {
            s.health.insert(runner_id.to_string(), Err(message.into()));
        });
    }

    pub fn set_snapshot_info(&self, snapshot_ref: &str, info: SnapshotInfo) {
        self.with_script(|s| {
            s.snapshot_info.insert(snapshot_ref.to_string(), info);
        });
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.with_script(|s| s.calls.clone())
    }

    /// Calls of `op`, in order.
    pub fn calls_of(&self, op: &str) -> Vec<RunnerCall> {
        self.with_script(|s| s.calls.iter().filter(|c| c.op == op).cloned().collect())
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls_of(op).len()
    }

    async fn record(&self, runner: &RunnerTarget, op: &'static str, subject: &str) -> Result<()> {
        let (delay, failure) = self.with_script(|s| {
            s.calls.push(RunnerCall {
                runner_id: runner.id.clone(),
                op,
                subject: subject.to_string(),
            });
            let failure = s
                .next_failures
                .get_mut(op)
                .and_then(VecDeque::pop_front)
                .map(|f| f.to_error())
                .or_else(|| s.always_fail.get(op).map(Failure::to_error));
            (s.delays.get(op).copied(), failure)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RunnerApi for ScriptedRunner {
    async fn health(&self, runner: &RunnerTarget) -> Result<HealthReport> {
        self.record(runner, "health", &runner.id).await?;
        self.with_script(|s| match s.health.get(&runner.id) {
            Some(Ok(report)) => Ok(report.clone()),
            Some(Err(message)) => Err(Error::remote(message.clone())),
            None => Ok(HealthReport::default()),
        })
    }

    async fn create_sandbox(
        &self,
        runner: &RunnerTarget,
        req: &CreateSandboxRequest,
    ) -> Result<()> {
        self.record(runner, "create_sandbox", &req.sandbox_id).await
    }

    async fn start_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()> {
        self.record(runner, "start_sandbox", sandbox_id).await
    }

    async fn stop_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()> {
        self.record(runner, "stop_sandbox", sandbox_id).await
    }

    async fn destroy_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()> {
        self.record(runner, "destroy_sandbox", sandbox_id).await
    }

    async fn resize_sandbox(
        &self,
        runner: &RunnerTarget,
        sandbox_id: &str,
        _resources: &Resources,
    ) -> Result<()> {
        self.record(runner, "resize_sandbox", sandbox_id).await
    }

    async fn create_backup(&self, runner: &RunnerTarget, req: &BackupRequest) -> Result<()> {
        self.record(runner, "create_backup", &req.sandbox_id).await
    }

    async fn update_network_settings(
        &self,
        runner: &RunnerTarget,
        sandbox_id: &str,
        _settings: &NetworkSettings,
    ) -> Result<()> {
        self.record(runner, "update_network_settings", sandbox_id)
            .await
    }

    async fn create_sandbox_snapshot(
        &self,
        runner: &RunnerTarget,
        req: &SandboxSnapshotRequest,
    ) -> Result<()> {
        self.record(runner, "create_sandbox_snapshot", &req.sandbox_id)
            .await
    }

    async fn fork_sandbox(&self, runner: &RunnerTarget, req: &CopySandboxRequest) -> Result<()> {
        self.record(runner, "fork_sandbox", &req.target_sandbox_id)
            .await
    }

    async fn clone_sandbox(&self, runner: &RunnerTarget, req: &CopySandboxRequest) -> Result<()> {
        self.record(runner, "clone_sandbox", &req.target_sandbox_id)
            .await
    }

    async fn build_snapshot(
        &self,
        runner: &RunnerTarget,
        req: &BuildSnapshotRequest,
    ) -> Result<()> {
        self.record(runner, "build_snapshot", &req.snapshot_ref)
            .await
    }

    async fn pull_snapshot(&self, runner: &RunnerTarget, req: &PullSnapshotRequest) -> Result<()> {
        self.record(runner, "pull_snapshot", &req.snapshot_ref).await
    }

    async fn remove_snapshot(&self, runner: &RunnerTarget, snapshot_ref: &str) -> Result<()> {
        self.record(runner, "remove_snapshot", snapshot_ref).await
    }

    async fn inspect_snapshot(
        &self,
        runner: &RunnerTarget,
        snapshot_ref: &str,
    ) -> Result<SnapshotInfo> {
        self.record(runner, "inspect_snapshot", snapshot_ref)
            .await?;
        Ok(self.with_script(|s| {
            s.snapshot_info
                .get(snapshot_ref)
                .cloned()
                .unwrap_or_default()
        }))
    }

    async fn pull_disk(&self, runner: &RunnerTarget, req: &DiskRequest) -> Result<()> {
        self.record(runner, "pull_disk", &req.disk_id).await
    }

    async fn push_disk(&self, runner: &RunnerTarget, req: &DiskRequest) -> Result<()> {
        self.record(runner, "push_disk", &req.disk_id).await
    }

    async fn fork_disk(&self, runner: &RunnerTarget, req: &ForkDiskRequest) -> Result<()> {
        self.record(runner, "fork_disk", &req.disk_id).await
    }

    async fn delete_disk(&self, runner: &RunnerTarget, disk_id: &str) -> Result<()> {
        self.record(runner, "delete_disk", disk_id).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> RunnerTarget {
        RunnerTarget::new("r1", "http://localhost:1/", "k")
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let api = ScriptedRunner::new();
        api.fail_next("start_sandbox", "boom");
        assert!(api.start_sandbox(&runner(), "sb").await.is_err());
        assert!(api.start_sandbox(&runner(), "sb").await.is_ok());
        assert_eq!(api.count("start_sandbox"), 2);
    }

    #[tokio::test]
    async fn always_failure_persists_until_cleared() {
        let api = ScriptedRunner::new();
        api.fail_always("stop_sandbox", "nope");
        assert!(api.stop_sandbox(&runner(), "sb").await.is_err());
        assert!(api.stop_sandbox(&runner(), "sb").await.is_err());
        api.clear_failures();
        assert!(api.stop_sandbox(&runner(), "sb").await.is_ok());
    }

    #[tokio::test]
    async fn health_defaults_and_overrides() {
        let api = ScriptedRunner::new();
        assert_eq!(api.health(&runner()).await.unwrap(), HealthReport::default());
        api.set_unhealthy("r1", "connection refused");
        assert!(api.health(&runner()).await.is_err());
    }
}
