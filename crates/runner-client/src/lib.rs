//! The runner API: the capability set the control plane needs from a runner's
//! local agent, plus an HTTP adapter and a scripted double for tests.
//!
//! Every mutating call must be idempotent on the runner side. Retrying
//! `start_sandbox` after a start that already succeeded is a no-op.

pub mod error;
pub mod http;
pub mod scripted;
pub mod types;

use async_trait::async_trait;

pub use {
    error::{Error, Result},
    http::HttpRunnerApi,
    scripted::{RunnerCall, ScriptedRunner},
    types::*,
};

use corral_common::Resources;

#[async_trait]
pub trait RunnerApi: Send + Sync {
    async fn health(&self, runner: &RunnerTarget) -> Result<HealthReport>;

    async fn create_sandbox(&self, runner: &RunnerTarget, req: &CreateSandboxRequest)
    -> Result<()>;
    async fn start_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()>;
    async fn stop_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()>;
    async fn destroy_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()>;
    async fn resize_sandbox(
        &self,
        runner: &RunnerTarget,
        sandbox_id: &str,
        resources: &Resources,
    ) -> Result<()>;
    async fn create_backup(&self, runner: &RunnerTarget, req: &BackupRequest) -> Result<()>;
    async fn update_network_settings(
        &self,
        runner: &RunnerTarget,
        sandbox_id: &str,
        settings: &NetworkSettings,
    ) -> Result<()>;
    async fn create_sandbox_snapshot(
        &self,
        runner: &RunnerTarget,
        req: &SandboxSnapshotRequest,
    ) -> Result<()>;
    async fn fork_sandbox(&self, runner: &RunnerTarget, req: &CopySandboxRequest) -> Result<()>;
    async fn clone_sandbox(&self, runner: &RunnerTarget, req: &CopySandboxRequest) -> Result<()>;

    async fn build_snapshot(&self, runner: &RunnerTarget, req: &BuildSnapshotRequest)
    -> Result<()>;
    async fn pull_snapshot(&self, runner: &RunnerTarget, req: &PullSnapshotRequest) -> Result<()>;
    async fn remove_snapshot(&self, runner: &RunnerTarget, snapshot_ref: &str) -> Result<()>;
    async fn inspect_snapshot(
        &self,
        runner: &RunnerTarget,
        snapshot_ref: &str,
    ) -> Result<SnapshotInfo>;

    async fn pull_disk(&self, runner: &RunnerTarget, req: &DiskRequest) -> Result<()>;
    async fn push_disk(&self, runner: &RunnerTarget, req: &DiskRequest) -> Result<()>;
    async fn fork_disk(&self, runner: &RunnerTarget, req: &ForkDiskRequest) -> Result<()>;
    async fn delete_disk(&self, runner: &RunnerTarget, disk_id: &str) -> Result<()>;
}
