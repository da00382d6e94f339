//! Configuration validation.
//!
//! Reports parse failures, keys the schema does not know about, and values
//! outside the range the control plane can work with.

use std::path::{Path, PathBuf};

use crate::{
    loader::{parse_config, parse_config_value},
    schema::CorralConfig,
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. `dispatcher.workers`.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate the file at `path`. The extension selects the format.
#[must_use]
pub fn validate_file(path: &Path) -> ValidationResult {
    let mut result = match std::fs::read_to_string(path) {
        Ok(raw) => validate_str(&crate::env_subst::substitute_env(&raw), path),
        Err(e) => {
            let mut r = ValidationResult::default();
            r.push(Severity::Error, "", format!("failed to read config file: {e}"));
            r
        },
    };
    result.config_path = Some(path.to_path_buf());
    result
}

/// Validate raw config text; `path` only selects the format.
#[must_use]
pub fn validate_str(raw: &str, path: &Path) -> ValidationResult {
    let mut result = ValidationResult::default();

    let value = match parse_config_value(raw, path) {
        Ok(v) => v,
        Err(e) => {
            result.push(Severity::Error, "", format!("syntax error: {e}"));
            return result;
        },
    };

    if let Ok(known) = serde_json::to_value(CorralConfig::default()) {
        check_unknown_keys(&value, &known, "", &mut result);
    }

    match parse_config(raw, path) {
        Ok(config) => check_config(&config, &mut result),
        Err(e) => result.push(Severity::Error, "", format!("type error: {e}")),
    }
    result
}

/// Range checks on an already parsed config.
#[must_use]
pub fn validate_config(config: &CorralConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    check_config(config, &mut result);
    result
}

fn check_unknown_keys(
    value: &serde_json::Value,
    known: &serde_json::Value,
    prefix: &str,
    result: &mut ValidationResult,
) {
    let (Some(actual), Some(expected)) = (value.as_object(), known.as_object()) else {
        return;
    };
    for (key, child) in actual {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match expected.get(key) {
            Some(known_child) => check_unknown_keys(child, known_child, &path, result),
            None => result.push(Severity::Warning, &path, "unknown field, ignored"),
        }
    }
}

fn check_config(config: &CorralConfig, result: &mut ValidationResult) {
    use Severity::{Error, Warning};

    if config.database.url.is_empty() {
        result.push(Error, "database.url", "must not be empty");
    }
    if config.database.max_connections == 0 {
        result.push(Error, "database.max_connections", "must be at least 1");
    }

    let d = &config.dispatcher;
    if d.workers == 0 {
        result.push(Error, "dispatcher.workers", "must be at least 1");
    }
    if d.poll_interval_ms == 0 {
        result.push(Error, "dispatcher.poll_interval_ms", "must be greater than 0");
    }
    if d.stale_job_secs == 0 {
        result.push(Error, "dispatcher.stale_job_secs", "must be greater than 0");
    }
    if d.backoff_base_ms > d.backoff_cap_ms {
        result.push(
            Warning,
            "dispatcher.backoff_base_ms",
            format!(
                "base {}ms exceeds cap {}ms; every retry waits the cap",
                d.backoff_base_ms, d.backoff_cap_ms
            ),
        );
    }
    let t = &d.timeouts;
    for (field, secs) in [
        ("default_secs", t.default_secs),
        ("build_snapshot_secs", t.build_snapshot_secs),
        ("pull_snapshot_secs", t.pull_snapshot_secs),
        ("create_backup_secs", t.create_backup_secs),
        ("create_sandbox_snapshot_secs", t.create_sandbox_snapshot_secs),
    ] {
        if secs == 0 {
            result.push(
                Error,
                &format!("dispatcher.timeouts.{field}"),
                "must be greater than 0",
            );
        }
    }

    let a = &config.allocator;
    if a.availability_score_threshold > 100 {
        result.push(
            Error,
            "allocator.availability_score_threshold",
            "scores range from 0 to 100",
        );
    }
    if a.utilization_weight < 0.0 {
        result.push(Error, "allocator.utilization_weight", "must not be negative");
    }
    if a.candidate_limit == 0 {
        result.push(Error, "allocator.candidate_limit", "must be at least 1");
    }
    if a.action_load.penalty_divisor == 0 {
        result.push(
            Error,
            "allocator.action_load.penalty_divisor",
            "must be at least 1",
        );
    }

    let s = &config.scoring;
    let weights = [
        s.cpu_usage_weight,
        s.memory_usage_weight,
        s.disk_usage_weight,
        s.allocated_cpu_weight,
        s.allocated_memory_weight,
        s.allocated_disk_weight,
    ];
    if weights.iter().any(|w| *w < 0.0) {
        result.push(Error, "scoring", "weights must not be negative");
    } else if weights.iter().sum::<f64>() <= 0.0 {
        result.push(Error, "scoring", "at least one weight must be positive");
    }
    for (field, threshold) in [
        ("cpu_penalty_threshold", s.cpu_penalty_threshold),
        ("memory_penalty_threshold", s.memory_penalty_threshold),
        ("disk_penalty_threshold", s.disk_penalty_threshold),
    ] {
        if !(0.0..=100.0).contains(&threshold) {
            result.push(
                Warning,
                &format!("scoring.{field}"),
                "thresholds are usage percentages between 0 and 100",
            );
        }
    }

    let h = &config.health;
    if h.interval_secs == 0 {
        result.push(Error, "health.interval_secs", "must be greater than 0");
    }
    if h.timeout_ms == 0 {
        result.push(Error, "health.timeout_ms", "must be greater than 0");
    }
    if h.retry_delays_ms.is_empty() {
        result.push(
            Warning,
            "health.retry_delays_ms",
            "no retries; a single failed probe marks a runner unresponsive",
        );
    }

    if config.warm_pool.interval_secs == 0 {
        result.push(Error, "warm_pool.interval_secs", "must be greater than 0");
    }
    if config.snapshots.interval_secs == 0 {
        result.push(Error, "snapshots.interval_secs", "must be greater than 0");
    }
    if config.snapshots.max_size_gib <= 0.0 {
        result.push(Error, "snapshots.max_size_gib", "must be greater than 0");
    }
    if config.backups.interval_secs == 0 {
        result.push(Error, "backups.interval_secs", "must be greater than 0");
    }
    if config.sweeps.interval_secs == 0 {
        result.push(Error, "sweeps.interval_secs", "must be greater than 0");
    }
    if config.sweeps.page_size == 0 {
        result.push(Error, "sweeps.page_size", "must be at least 1");
    }
    if config.sweeps.max_archiving_per_runner == 0 {
        result.push(
            Error,
            "sweeps.max_archiving_per_runner",
            "must be at least 1 or nothing is ever archived",
        );
    }

    let l = &config.locks;
    if l.state_change_ttl_secs == 0 {
        result.push(Error, "locks.state_change_ttl_secs", "must be greater than 0");
    } else if l.state_change_ttl_secs.saturating_mul(1_000) < l.wait_timeout_ms {
        result.push(
            Warning,
            "locks.wait_timeout_ms",
            "waiting longer than a lease lives; abandoned leases expire first",
        );
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn toml(raw: &str) -> ValidationResult {
        validate_str(raw, Path::new("corral.toml"))
    }

    #[test]
    fn empty_config_is_valid() {
        let result = toml("");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn syntax_error_is_reported() {
        let result = toml("[dispatcher\nworkers = 1");
        assert!(result.has_errors());
        assert!(result.diagnostics[0].message.contains("syntax"));
    }

    #[test]
    fn type_error_is_reported() {
        let result = toml("[dispatcher]\nworkers = \"four\"\n");
        assert!(result.has_errors());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.message.starts_with("type error"))
        );
    }

    #[test]
    fn unknown_nested_key_is_warned() {
        let result = toml("[dispatcher]\nworkerz = 3\n[bogus]\nx = 1\n");
        let paths: Vec<_> = result.diagnostics.iter().map(|d| d.path.as_str()).collect();
        assert!(paths.contains(&"dispatcher.workerz"));
        assert!(paths.contains(&"bogus"));
        assert!(!result.has_errors());
    }

    #[rstest]
    #[case("[dispatcher]\nworkers = 0\n", "dispatcher.workers")]
    #[case("[allocator]\navailability_score_threshold = 101\n", "allocator.availability_score_threshold")]
    #[case("[allocator.action_load]\npenalty_divisor = 0\n", "allocator.action_load.penalty_divisor")]
    #[case("[sweeps]\nmax_archiving_per_runner = 0\n", "sweeps.max_archiving_per_runner")]
    #[case("[dispatcher.timeouts]\nbuild_snapshot_secs = 0\n", "dispatcher.timeouts.build_snapshot_secs")]
    #[case("[locks]\nstate_change_ttl_secs = 0\n", "locks.state_change_ttl_secs")]
    fn out_of_range_is_an_error(#[case] raw: &str, #[case] path: &str) {
        let result = toml(raw);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == Severity::Error && d.path == path),
            "{:?}",
            result.diagnostics
        );
    }

    #[test]
    fn all_zero_weights_are_rejected() {
        let result = toml(
            "[scoring]\ncpu_usage_weight = 0.0\nmemory_usage_weight = 0.0\ndisk_usage_weight = 0.0\n\
             allocated_cpu_weight = 0.0\nallocated_memory_weight = 0.0\nallocated_disk_weight = 0.0\n",
        );
        assert!(result.has_errors());
    }

    #[test]
    fn empty_retry_delays_is_a_warning() {
        let result = toml("[health]\nretry_delays_ms = []\n");
        assert!(!result.has_errors());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].severity, Severity::Warning);
    }

    #[test]
    fn yaml_is_validated_too() {
        let result = validate_str("dispatcher:\n  workers: 0\n", Path::new("corral.yaml"));
        assert!(result.has_errors());
    }

    #[test]
    fn validate_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        std::fs::write(&path, "[sweeps]\npage_size = 0\n").unwrap();
        let result = validate_file(&path);
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(result.has_errors());
    }
}
