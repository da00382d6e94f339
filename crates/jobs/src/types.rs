use {
    corral_common::now_ms,
    serde::{Deserialize, Serialize},
};

use crate::recovery::OperationKind;

/// Every unit of work the dispatcher knows how to execute. Closed: job types
/// are never taken from user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    CreateSandbox,
    StartSandbox,
    StopSandbox,
    DestroySandbox,
    CreateBackup,
    BuildSnapshot,
    PullSnapshot,
    RemoveSnapshot,
    UpdateSandboxNetworkSettings,
    CreateSandboxSnapshot,
    ForkSandbox,
    CloneSandbox,
    ResizeSandbox,
    RecoverSandbox,
}

impl JobType {
    pub const ALL: [Self; 14] = [
        Self::CreateSandbox,
        Self::StartSandbox,
        Self::StopSandbox,
        Self::DestroySandbox,
        Self::CreateBackup,
        Self::BuildSnapshot,
        Self::PullSnapshot,
        Self::RemoveSnapshot,
        Self::UpdateSandboxNetworkSettings,
        Self::CreateSandboxSnapshot,
        Self::ForkSandbox,
        Self::CloneSandbox,
        Self::ResizeSandbox,
        Self::RecoverSandbox,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateSandbox => "CREATE_SANDBOX",
            Self::StartSandbox => "START_SANDBOX",
            Self::StopSandbox => "STOP_SANDBOX",
            Self::DestroySandbox => "DESTROY_SANDBOX",
            Self::CreateBackup => "CREATE_BACKUP",
            Self::BuildSnapshot => "BUILD_SNAPSHOT",
            Self::PullSnapshot => "PULL_SNAPSHOT",
            Self::RemoveSnapshot => "REMOVE_SNAPSHOT",
            Self::UpdateSandboxNetworkSettings => "UPDATE_SANDBOX_NETWORK_SETTINGS",
            Self::CreateSandboxSnapshot => "CREATE_SANDBOX_SNAPSHOT",
            Self::ForkSandbox => "FORK_SANDBOX",
            Self::CloneSandbox => "CLONE_SANDBOX",
            Self::ResizeSandbox => "RESIZE_SANDBOX",
            Self::RecoverSandbox => "RECOVER_SANDBOX",
        }
    }

    /// The kind of row the job's `resource_id` refers to.
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            Self::BuildSnapshot | Self::PullSnapshot | Self::RemoveSnapshot => {
                ResourceKind::Snapshot
            },
            _ => ResourceKind::Sandbox,
        }
    }

    /// Which transient-retry rules apply when the job fails.
    pub fn operation_kind(self) -> OperationKind {
        match self {
            Self::CreateSandbox | Self::StartSandbox | Self::RecoverSandbox => OperationKind::Start,
            Self::StopSandbox => OperationKind::Stop,
            _ => OperationKind::Generic,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Sandbox,
    Snapshot,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    /// Runner the work is sent to; snapshot jobs may fan out and leave it unset.
    #[serde(default)]
    pub runner_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Failed executions so far.
    #[serde(default)]
    pub attempt: u32,
    /// Not claimable before this instant.
    #[serde(default)]
    pub run_after_ms: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
    pub updated_at_ms: u64,
}

impl Job {
    pub fn new(job_type: JobType, resource_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            status: JobStatus::Pending,
            resource_kind: job_type.resource_kind(),
            resource_id: resource_id.into(),
            runner_id: None,
            payload: serde_json::Value::Null,
            attempt: 0,
            run_after_ms: 0,
            error_message: None,
            created_at_ms: now,
            started_at_ms: None,
            finished_at_ms: None,
            updated_at_ms: now,
        }
    }

    #[must_use]
    pub fn on_runner(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = Some(runner_id.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// `sandbox:<id>` / `snapshot:<id>`, used in logs and conflict errors.
    pub fn resource_key(&self) -> String {
        format!("{}:{}", self.resource_kind, self.resource_id)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn names_round_trip_through_serde() {
        for t in JobType::ALL {
            let json = serde_json::to_string(&t).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<JobType>(), Ok(t));
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!("DROP_TABLE".parse::<JobType>().is_err());
        assert!(serde_json::from_str::<JobType>("\"MINE_BITCOIN\"").is_err());
    }

    #[rstest]
    #[case(JobType::BuildSnapshot, ResourceKind::Snapshot)]
    #[case(JobType::RemoveSnapshot, ResourceKind::Snapshot)]
    #[case(JobType::CreateBackup, ResourceKind::Sandbox)]
    #[case(JobType::CloneSandbox, ResourceKind::Sandbox)]
    fn resource_kinds(#[case] t: JobType, #[case] kind: ResourceKind) {
        assert_eq!(t.resource_kind(), kind);
    }

    #[rstest]
    #[case(JobType::StartSandbox, OperationKind::Start)]
    #[case(JobType::CreateSandbox, OperationKind::Start)]
    #[case(JobType::StopSandbox, OperationKind::Stop)]
    #[case(JobType::DestroySandbox, OperationKind::Generic)]
    fn operation_kinds(#[case] t: JobType, #[case] op: OperationKind) {
        assert_eq!(t.operation_kind(), op);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
