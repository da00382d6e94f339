use std::collections::BTreeSet;

use {
    corral_common::{Resources, now_ms},
    corral_registry::RunnerClass,
    serde::{Deserialize, Serialize},
};

/// Entrypoint used when neither the request nor the image defines one.
pub const DEFAULT_ENTRYPOINT: [&str; 2] = ["sleep", "infinity"];

/// ```text
/// build_pending ─▶ building ─▶ pending ─▶ pulling ─▶ pending_validation ─▶ validating ─▶ active ⇄ inactive
///                     └▶ build_failed        └────────────────────────────────┴▶ error
/// any ─remove─▶ removing ─▶ (row deleted)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    BuildPending,
    Building,
    #[default]
    Pending,
    Pulling,
    PendingValidation,
    Validating,
    Active,
    Inactive,
    Error,
    BuildFailed,
    Removing,
}

impl SnapshotState {
    pub const IN_PIPELINE: [Self; 7] = [
        Self::BuildPending,
        Self::Building,
        Self::Pending,
        Self::Pulling,
        Self::PendingValidation,
        Self::Validating,
        Self::Removing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildPending => "build_pending",
            Self::Building => "building",
            Self::Pending => "pending",
            Self::Pulling => "pulling",
            Self::PendingValidation => "pending_validation",
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::BuildFailed => "build_failed",
            Self::Removing => "removing",
        }
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    /// Image reference pulled by runners.
    pub image_name: String,
    /// Minimum shape a sandbox from this snapshot gets.
    pub resources: Resources,
    pub class: RunnerClass,
    pub experimental: bool,
    pub state: SnapshotState,
    /// Regions the snapshot is available in; empty means everywhere.
    #[serde(default)]
    pub regions: BTreeSet<String>,
    /// Build definition; present for snapshots built from source.
    #[serde(default)]
    pub build_context: Option<String>,
    /// Runner that built or last pulled the image.
    #[serde(default)]
    pub runner_id: Option<String>,
    #[serde(default)]
    pub size_gib: Option<f64>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub last_used_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Snapshot {
    pub fn is_available_in(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.contains(region)
    }
}

/// Request to register a snapshot.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub organization_id: String,
    pub name: String,
    pub image_name: String,
    pub resources: Resources,
    pub class: RunnerClass,
    pub regions: BTreeSet<String>,
    pub build_context: Option<String>,
    pub entrypoint: Vec<String>,
}

impl NewSnapshot {
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            image_name: image_name.into(),
            resources: Resources::new(1, 1, 3),
            class: RunnerClass::Linux,
            regions: BTreeSet::new(),
            build_context: None,
            entrypoint: Vec::new(),
        }
    }

    pub(crate) fn into_snapshot(self) -> Snapshot {
        let now = now_ms();
        let state = if self.build_context.is_some() {
            SnapshotState::BuildPending
        } else {
            SnapshotState::Pending
        };
        Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: self.organization_id,
            name: self.name,
            image_name: self.image_name,
            resources: self.resources,
            class: self.class,
            experimental: self.class.is_experimental(),
            state,
            regions: self.regions,
            build_context: self.build_context,
            runner_id: None,
            size_gib: None,
            entrypoint: self.entrypoint,
            error_reason: None,
            last_used_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}
