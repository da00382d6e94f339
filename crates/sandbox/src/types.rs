use std::collections::BTreeMap;

use {
    corral_common::{Resources, now_ms},
    corral_jobs::{Classification, RecoveryType},
    corral_registry::RunnerClass,
    corral_runner_client::NetworkSettings,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Actual state of a sandbox, as last written by the reconciler or a job result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    #[default]
    Creating,
    PendingBuild,
    BuildingSnapshot,
    PullingSnapshot,
    Restoring,
    Started,
    Starting,
    Stopping,
    Stopped,
    Resizing,
    Archiving,
    Archived,
    PendingArchive,
    Destroying,
    Destroyed,
    Error,
    BuildFailed,
    Unknown,
}

impl SandboxState {
    pub const ALL: [Self; 18] = [
        Self::Creating,
        Self::PendingBuild,
        Self::BuildingSnapshot,
        Self::PullingSnapshot,
        Self::Restoring,
        Self::Started,
        Self::Starting,
        Self::Stopping,
        Self::Stopped,
        Self::Resizing,
        Self::Archiving,
        Self::Archived,
        Self::PendingArchive,
        Self::Destroying,
        Self::Destroyed,
        Self::Error,
        Self::BuildFailed,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::PendingBuild => "pending_build",
            Self::BuildingSnapshot => "building_snapshot",
            Self::PullingSnapshot => "pulling_snapshot",
            Self::Restoring => "restoring",
            Self::Started => "started",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Resizing => "resizing",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
            Self::PendingArchive => "pending_archive",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
            Self::BuildFailed => "build_failed",
            Self::Unknown => "unknown",
        }
    }

    /// Still holds a reservation on its runner.
    pub fn occupies_runner(self) -> bool {
        !matches!(
            self,
            Self::Archived
                | Self::Destroyed
                | Self::PendingBuild
                | Self::BuildingSnapshot
                | Self::PullingSnapshot
        )
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown sandbox state: {s}"))
    }
}

/// Target the reconciler drives a sandbox towards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Started,
    Stopped,
    Resized,
    Archived,
    Destroyed,
}

impl DesiredState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Resized => "resized",
            Self::Archived => "archived",
            Self::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "stopped" => Ok(Self::Stopped),
            "resized" => Ok(Self::Resized),
            "archived" => Ok(Self::Archived),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(format!("unknown desired state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    #[default]
    None,
    Pending,
    InProgress,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub region: String,
    pub class: RunnerClass,
    #[serde(default)]
    pub runner_id: Option<String>,
    /// Snapshot name the sandbox boots from.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Image reference resolved from `snapshot` once it is active.
    #[serde(default)]
    pub image: Option<String>,
    pub os_user: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub state: SandboxState,
    pub desired_state: DesiredState,
    pub resources: Resources,
    /// Target shape while a resize is in flight.
    #[serde(default)]
    pub pending_resources: Option<Resources>,
    /// State to return to once a resize finishes.
    #[serde(default)]
    pub resize_from: Option<SandboxState>,
    #[serde(default)]
    pub network: NetworkSettings,
    /// Set on forks: the sandbox this one was forked from.
    #[serde(default)]
    pub parent_sandbox_id: Option<String>,
    /// Set on clones: the sandbox whose filesystem was copied.
    #[serde(default)]
    pub source_sandbox_id: Option<String>,
    /// Attached disk ids, in mount order.
    #[serde(default)]
    pub disks: Vec<String>,
    #[serde(default)]
    pub backup_state: BackupState,
    /// Backup image references, newest last.
    #[serde(default)]
    pub backup_refs: Vec<String>,
    #[serde(default)]
    pub backup_started_at_ms: Option<u64>,
    #[serde(default)]
    pub last_backup_at_ms: Option<u64>,
    /// Consecutive failed archive backups.
    #[serde(default)]
    pub backup_failures: u32,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default)]
    pub recovery_type: Option<RecoveryType>,
    /// Minutes of inactivity before a started sandbox is stopped; 0 disables.
    pub auto_stop_minutes: u32,
    /// Minutes a stopped sandbox waits before it is archived; 0 disables.
    pub auto_archive_minutes: u32,
    /// Minutes a stopped sandbox waits before it is destroyed; negative disables,
    /// 0 destroys instead of stopping.
    pub auto_delete_minutes: i32,
    /// Only runners owned by the organization may host it.
    #[serde(default)]
    pub dedicated_only: bool,
    /// Warm pool the sandbox idles in until claimed.
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(serialize_with = "serialize_secret")]
    pub auth_token: Secret<String>,
    pub last_activity_at_ms: u64,
    pub state_changed_at_ms: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Sandbox {
    /// Write `state` and stamp the transition time.
    pub fn set_state(&mut self, state: SandboxState) {
        if self.state != state {
            self.state = state;
            self.state_changed_at_ms = now_ms();
        }
    }

    /// Park in `error`. Anything but a fatal classification stays eligible
    /// for an explicit recovery.
    pub fn set_error(&mut self, reason: impl Into<String>, classification: Classification) {
        self.set_state(SandboxState::Error);
        self.error_reason = Some(reason.into());
        self.recoverable = classification != Classification::Fatal;
        self.recovery_type = match classification {
            Classification::Recoverable(kind) => Some(kind),
            Classification::RetryTransient | Classification::Fatal => None,
        };
    }

    pub fn clear_error(&mut self) {
        self.error_reason = None;
        self.recoverable = false;
        self.recovery_type = None;
    }

    pub fn touch(&mut self) {
        self.last_activity_at_ms = now_ms();
    }
}

/// Creation request, already authorized by the caller.
#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub organization_id: String,
    pub name: String,
    pub region: String,
    pub class: RunnerClass,
    pub snapshot: Option<String>,
    pub os_user: String,
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    pub network: NetworkSettings,
    pub auto_stop_minutes: u32,
    pub auto_archive_minutes: u32,
    pub auto_delete_minutes: i32,
    pub dedicated_only: bool,
}

impl NewSandbox {
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            region: region.into(),
            class: RunnerClass::Linux,
            snapshot: None,
            os_user: "sandbox".into(),
            env: BTreeMap::new(),
            resources: Resources::new(1, 1, 3),
            network: NetworkSettings::default(),
            auto_stop_minutes: 15,
            auto_archive_minutes: 7 * 24 * 60,
            auto_delete_minutes: -1,
            dedicated_only: false,
        }
    }

    pub(crate) fn into_sandbox(self) -> Sandbox {
        let now = now_ms();
        Sandbox {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: self.organization_id,
            name: self.name,
            region: self.region,
            class: self.class,
            runner_id: None,
            snapshot: self.snapshot,
            image: None,
            os_user: self.os_user,
            env: self.env,
            state: SandboxState::Creating,
            desired_state: DesiredState::Started,
            resources: self.resources,
            pending_resources: None,
            resize_from: None,
            network: self.network,
            parent_sandbox_id: None,
            source_sandbox_id: None,
            disks: Vec::new(),
            backup_state: BackupState::None,
            backup_refs: Vec::new(),
            backup_started_at_ms: None,
            last_backup_at_ms: None,
            backup_failures: 0,
            error_reason: None,
            recoverable: false,
            recovery_type: None,
            auto_stop_minutes: self.auto_stop_minutes,
            auto_archive_minutes: self.auto_archive_minutes,
            auto_delete_minutes: self.auto_delete_minutes,
            dedicated_only: self.dedicated_only,
            pool_id: None,
            auth_token: Secret::new(uuid::Uuid::new_v4().simple().to_string()),
            last_activity_at_ms: now,
            state_changed_at_ms: now,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_parse_back() {
        for state in SandboxState::ALL {
            assert_eq!(state.as_str().parse::<SandboxState>(), Ok(state));
            assert_eq!(
                serde_json::to_string(&state).unwrap_or_default(),
                format!("\"{state}\"")
            );
        }
        assert!("paused".parse::<SandboxState>().is_err());
    }

    #[test]
    fn auth_token_survives_serde() {
        let sandbox = NewSandbox::new("org", "sb", "eu").into_sandbox();
        let json = serde_json::to_string(&sandbox).unwrap_or_default();
        let back: Sandbox = serde_json::from_str(&json).unwrap_or_else(|_| sandbox.clone());
        assert_eq!(back.auth_token.expose_secret(), sandbox.auth_token.expose_secret());
        assert_eq!(back.state, SandboxState::Creating);
    }

    #[test]
    fn error_fields_follow_recovery() {
        let mut sandbox = NewSandbox::new("org", "sb", "eu").into_sandbox();
        sandbox.set_error(
            "No space left on device",
            Classification::Recoverable(RecoveryType::StorageExpansion),
        );
        assert!(sandbox.recoverable);
        assert_eq!(sandbox.recovery_type, Some(RecoveryType::StorageExpansion));
        sandbox.set_error("permission denied", Classification::Fatal);
        assert!(!sandbox.recoverable);
        sandbox.clear_error();
        assert!(!sandbox.recoverable);
        assert!(sandbox.error_reason.is_none());
    }
}
