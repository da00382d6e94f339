//! Request and response shapes exchanged with runners.
use std::collections::BTreeMap;

use {
    corral_common::Resources,
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

/// Address and credentials of one runner.
#[derive(Debug, Clone)]
pub struct RunnerTarget {
    pub id: String,
    pub api_url: String,
    pub api_key: Secret<String>,
}

impl RunnerTarget {
    pub fn new(id: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_url: api_url.into(),
            api_key: Secret::new(api_key.into()),
        }
    }
}

/// Outbound network policy of a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    pub block_all: bool,
    #[serde(default)]
    pub allow_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    pub sandbox_id: String,
    pub snapshot: Option<String>,
    pub os_user: String,
    pub resources: Resources,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub network: NetworkSettings,
    pub auth_token: String,
    /// Backup image to restore from instead of the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_from: Option<String>,
    /// Disks attached at boot, in mount order.
    #[serde(default)]
    pub disks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    pub sandbox_id: String,
    /// Registry reference the backup image is pushed to.
    pub backup_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSnapshotRequest {
    pub sandbox_id: String,
    pub name: String,
}

/// Fork and clone share a request shape; the runner copies `source` into `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySandboxRequest {
    pub source_sandbox_id: String,
    pub target_sandbox_id: String,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSnapshotRequest {
    pub snapshot_ref: String,
    /// Dockerfile or equivalent build definition.
    pub build_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSnapshotRequest {
    pub snapshot_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub size_gib: f64,
    #[serde(default)]
    pub entrypoint: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskRequest {
    pub disk_id: String,
    pub size_gib: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkDiskRequest {
    pub base_disk_id: String,
    pub disk_id: String,
}

/// Usage report returned by a runner's health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthReport {
    /// Live utilization, percent.
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub allocated_cpu: u32,
    pub allocated_memory_gib: u32,
    pub allocated_disk_gib: u32,
    pub version: Option<String>,
}
