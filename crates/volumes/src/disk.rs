use {
    corral_common::now_ms,
    serde::{Deserialize, Serialize},
};

/// ```text
/// fresh ─pull─▶ pulling ─▶ ready ─attach─▶ attached ⇄ detached
/// ready/detached ─push─▶ pending_push ─▶ pushing ─▶ stored
/// * ─delete─▶ pending_delete ─▶ deleting ─▶ deleted
/// forking ─▶ ready            (new disk created by fork)
/// locked                      (source of an in-flight fork)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    #[default]
    Fresh,
    Pulling,
    Ready,
    Attached,
    Detached,
    Forking,
    PendingPush,
    Pushing,
    Stored,
    PendingDelete,
    Deleting,
    Deleted,
    Locked,
    Error,
}

impl DiskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Pulling => "pulling",
            Self::Ready => "ready",
            Self::Attached => "attached",
            Self::Detached => "detached",
            Self::Forking => "forking",
            Self::PendingPush => "pending_push",
            Self::Pushing => "pushing",
            Self::Stored => "stored",
            Self::PendingDelete => "pending_delete",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Locked => "locked",
            Self::Error => "error",
        }
    }

    /// States from which a disk can be attached to a sandbox.
    pub fn is_attachable(self) -> bool {
        matches!(self, Self::Fresh | Self::Ready | Self::Detached | Self::Stored)
    }

    /// States whose data can be copied into a new disk.
    pub fn is_forkable(self) -> bool {
        self.is_attachable() || self == Self::Attached
    }
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub size_gib: u32,
    pub state: DiskState,
    /// Disk this one was forked from. A copy, not a live link.
    #[serde(default)]
    pub base_disk_id: Option<String>,
    /// Runner currently holding the disk image.
    #[serde(default)]
    pub runner_id: Option<String>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// State to return to when a lock taken for a fork is released.
    #[serde(default)]
    pub locked_from: Option<DiskState>,
    #[serde(default)]
    pub error_reason: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Disk {
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>, size_gib: u32) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            name: name.into(),
            size_gib,
            state: DiskState::Fresh,
            base_disk_id: None,
            runner_id: None,
            sandbox_id: None,
            locked_from: None,
            error_reason: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}
