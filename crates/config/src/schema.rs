//! Config schema for the control plane.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub allocator: AllocatorConfig,
    pub scoring: ScoringConfig,
    pub health: HealthConfig,
    pub warm_pool: WarmPoolConfig,
    pub sweeps: SweepsConfig,
    pub backups: BackupConfig,
    pub snapshots: SnapshotsConfig,
    pub locks: LocksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://corral.db?mode=rwc".into(),
            max_connections: 8,
        }
    }
}

/// Job dispatcher workers and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of concurrent workers claiming jobs.
    pub workers: usize,
    /// How long an idle worker sleeps before polling the job table again.
    pub poll_interval_ms: u64,
    /// Attempts allowed for a transient failure before the sandbox is parked
    /// in `error`.
    pub max_transient_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Grace on top of a job's execution timeout before an in-progress job
    /// is considered abandoned and failed.
    pub stale_job_secs: u64,
    pub timeouts: JobTimeouts,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            max_transient_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            stale_job_secs: 600,
            timeouts: JobTimeouts::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(20);
        self.backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms)
    }
}

/// Per-operation execution timeouts. Long-running operations get their own
/// bound; everything else uses `default_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTimeouts {
    pub default_secs: u64,
    pub build_snapshot_secs: u64,
    pub pull_snapshot_secs: u64,
    pub create_backup_secs: u64,
    pub create_sandbox_snapshot_secs: u64,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            default_secs: 120,
            build_snapshot_secs: 3_600,
            pull_snapshot_secs: 1_800,
            create_backup_secs: 1_800,
            create_sandbox_snapshot_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Runners scoring below this are not schedulable.
    pub availability_score_threshold: u32,
    /// Weight of mean live utilization (percent) in the ranking score.
    pub utilization_weight: f64,
    /// Candidates tried, best first, before reporting capacity exhaustion.
    pub candidate_limit: usize,
    pub action_load: ActionLoadConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            availability_score_threshold: 10,
            utilization_weight: 0.2,
            candidate_limit: 10,
            action_load: ActionLoadConfig::default(),
        }
    }
}

/// Points a runner accrues while it works on a lifecycle action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionLoadConfig {
    pub any_destroyed: u32,
    pub started_stopped: u32,
    pub building_snapshot_started: u32,
    pub pulling_snapshot_started: u32,
    pub restoring_started: u32,
    pub stopped_started: u32,
    pub any_started: u32,
    /// `penalty = min(points / penalty_divisor, penalty_maximum)`
    pub penalty_divisor: u32,
    pub penalty_maximum: u32,
}

impl Default for ActionLoadConfig {
    fn default() -> Self {
        Self {
            any_destroyed: 1,
            started_stopped: 1,
            building_snapshot_started: 10,
            pulling_snapshot_started: 6,
            restoring_started: 4,
            stopped_started: 2,
            any_started: 2,
            penalty_divisor: 2,
            penalty_maximum: 40,
        }
    }
}

/// Weights and penalties of the runner availability score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub cpu_usage_weight: f64,
    pub memory_usage_weight: f64,
    pub disk_usage_weight: f64,
    pub allocated_cpu_weight: f64,
    pub allocated_memory_weight: f64,
    pub allocated_disk_weight: f64,
    pub cpu_penalty_threshold: f64,
    pub memory_penalty_threshold: f64,
    pub disk_penalty_threshold: f64,
    pub cpu_penalty_exponent: f64,
    pub memory_penalty_exponent: f64,
    pub disk_penalty_exponent: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            cpu_usage_weight: 0.25,
            memory_usage_weight: 0.25,
            disk_usage_weight: 0.1,
            allocated_cpu_weight: 0.2,
            allocated_memory_weight: 0.15,
            allocated_disk_weight: 0.05,
            cpu_penalty_threshold: 90.0,
            memory_penalty_threshold: 75.0,
            disk_penalty_threshold: 90.0,
            cpu_penalty_exponent: 0.15,
            memory_penalty_exponent: 0.1,
            disk_penalty_exponent: 0.1,
        }
    }
}

/// Runner health polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// Delays between probe attempts; one attempt more than delays.
    pub retry_delays_ms: Vec<u64>,
    /// Runners that push heartbeats are unresponsive once the last one is older than this.
    pub stale_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 3_000,
            retry_delays_ms: vec![500, 1_000],
            stale_after_secs: 60,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub interval_secs: u64,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl WarmPoolConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Auto-stop, auto-archive and auto-delete sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepsConfig {
    pub interval_secs: u64,
    /// Sandboxes examined per sweep tick.
    pub page_size: usize,
    /// Sandboxes allowed in `archiving` on one runner at once.
    pub max_archiving_per_runner: usize,
}

impl Default for SweepsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            page_size: 100,
            max_archiving_per_runner: 3,
        }
    }
}

impl SweepsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub interval_secs: u64,
    /// Started sandboxes whose last backup is older than this get a new one.
    pub max_age_secs: u64,
    /// Failed archive backups retried before the sandbox goes to `error`.
    pub archive_retries: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_age_secs: 3_600,
            archive_retries: 3,
        }
    }
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub interval_secs: u64,
    /// Pulled images larger than this fail validation.
    pub max_size_gib: f64,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_size_gib: 20.0,
        }
    }
}

impl SnapshotsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Named lease locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Lease length of a state-change lock. A live holder renews it; this
    /// bounds how long a crashed holder blocks the key.
    pub state_change_ttl_secs: u64,
    /// How long a user request waits for a busy lock.
    pub wait_timeout_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            state_change_ttl_secs: 30,
            wait_timeout_ms: 10_000,
        }
    }
}

impl LocksConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.state_change_ttl_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(1, 1_000)]
    #[case(2, 2_000)]
    #[case(3, 4_000)]
    #[case(7, 60_000)]
    #[case(40, 60_000)]
    fn backoff_doubles_until_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.backoff(attempt), Duration::from_millis(expected_ms));
        assert_eq!(cfg.backoff_ms(attempt), expected_ms);
    }

    #[test]
    fn huge_backoff_saturates() {
        let cfg = DispatcherConfig {
            backoff_base_ms: u64::MAX / 2,
            backoff_cap_ms: u64::MAX,
            ..DispatcherConfig::default()
        };
        assert_eq!(cfg.backoff_ms(30), u64::MAX);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: CorralConfig = toml::from_str(
            r#"
[dispatcher]
workers = 16

[health]
retry_delays_ms = [100]
"#,
        )
        .unwrap();
        assert_eq!(cfg.dispatcher.workers, 16);
        assert_eq!(cfg.dispatcher.max_transient_retries, 3);
        assert_eq!(cfg.health.retry_delays_ms, vec![100]);
        assert_eq!(cfg.sweeps.max_archiving_per_runner, 3);
    }
}
