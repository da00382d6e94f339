use {
    corral_common::Resources,
    corral_runner_client::RunnerTarget,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Network endpoints through which the runners of one region are reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub id: String,
    pub proxy_url: Option<String>,
    pub toolbox_proxy_url: Option<String>,
    pub ssh_gateway_url: Option<String>,
    pub snapshot_manager_url: Option<String>,
    pub registry_id: Option<String>,
}

/// Workload class; a sandbox only lands on a runner of the same class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerClass {
    #[default]
    Linux,
    LinuxExp,
    WindowsExp,
    AndroidExp,
}

impl RunnerClass {
    pub fn is_experimental(self) -> bool {
        !matches!(self, Self::Linux)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::LinuxExp => "linux-exp",
            Self::WindowsExp => "windows-exp",
            Self::AndroidExp => "android-exp",
        }
    }
}

impl std::fmt::Display for RunnerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunnerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Self::Linux),
            "linux-exp" => Ok(Self::LinuxExp),
            "windows-exp" => Ok(Self::WindowsExp),
            "android-exp" => Ok(Self::AndroidExp),
            other => Err(format!("unknown runner class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Initializing,
    Ready,
    Unresponsive,
    Disabled,
    Decommissioned,
}

/// Live utilization reported by the runner, percent of capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Usage {
    pub fn mean(&self) -> f64 {
        (self.cpu + self.memory + self.disk) / 3.0
    }
}

/// How runners report liveness. `Poll` runners are probed by the control
/// plane; `Heartbeat` runners push health reports themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMode {
    #[default]
    Poll,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    pub id: String,
    pub region: String,
    pub class: RunnerClass,
    /// Experimental and stable workloads never share a runner.
    pub experimental: bool,
    /// Owning organization for dedicated runners; `None` is shared infrastructure.
    #[serde(default)]
    pub organization_id: Option<String>,
    pub api_url: String,
    #[serde(serialize_with = "serialize_secret")]
    pub api_key: Secret<String>,
    #[serde(default)]
    pub health_mode: HealthMode,
    /// Declared capacity.
    pub capacity: Resources,
    /// Sum of resources reserved by sandboxes placed here.
    #[serde(default)]
    pub allocated: Resources,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub availability_score: u32,
    #[serde(default)]
    pub action_load_points: u32,
    #[serde(default)]
    pub action_load_penalty: u32,
    #[serde(default)]
    pub state: RunnerState,
    /// No new placements; existing sandboxes keep running.
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_checked_ms: Option<u64>,
    #[serde(default)]
    pub last_heartbeat_ms: Option<u64>,
    pub created_at_ms: u64,
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Runner {
    pub fn new(
        id: impl Into<String>,
        region: impl Into<String>,
        class: RunnerClass,
        capacity: Resources,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            class,
            experimental: class.is_experimental(),
            organization_id: None,
            api_url: String::new(),
            api_key: Secret::new(String::new()),
            health_mode: HealthMode::Poll,
            capacity,
            allocated: Resources::default(),
            usage: Usage::default(),
            availability_score: 0,
            action_load_points: 0,
            action_load_penalty: 0,
            state: RunnerState::Initializing,
            draining: false,
            version: None,
            last_checked_ms: None,
            last_heartbeat_ms: None,
            created_at_ms: corral_common::now_ms(),
        }
    }

    /// Capacity not yet reserved by any sandbox.
    pub fn free(&self) -> Resources {
        self.capacity.saturating_sub(&self.allocated)
    }

    pub fn target(&self) -> RunnerTarget {
        RunnerTarget {
            id: self.id.clone(),
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
        }
    }

    /// Ready, not draining, and scoring at least `threshold`.
    pub fn is_schedulable(&self, threshold: u32) -> bool {
        self.state == RunnerState::Ready && !self.draining && self.availability_score >= threshold
    }
}

/// Maps accumulated action-load points to the penalty subtracted from a
/// runner's ranking score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyRule {
    pub divisor: u32,
    pub maximum: u32,
}

impl PenaltyRule {
    pub fn penalty(&self, points: u32) -> u32 {
        (points / self.divisor.max(1)).min(self.maximum)
    }
}
