//! Runner availability score.
//!
//! TOPSIS closeness between the runner's current position and two reference
//! points: the ideal (idle, exactly fully allocated) and the anti-ideal
//! (saturated, allocated five times over). The result is damped
//! exponentially once any live usage crosses its penalty threshold and scaled
//! to 0..=100.

use {corral_common::Resources, corral_config::ScoringConfig, tracing::warn};

use crate::types::Usage;

const IDEAL: [f64; 6] = [0.0, 0.0, 0.0, 100.0, 100.0, 100.0];
const ANTI_IDEAL: [f64; 6] = [100.0, 100.0, 100.0, 500.0, 500.0, 500.0];

fn ratio(allocated: u32, capacity: u32) -> f64 {
    f64::from(allocated) / f64::from(capacity) * 100.0
}

pub fn availability_score(
    usage: &Usage,
    capacity: &Resources,
    allocated: &Resources,
    cfg: &ScoringConfig,
) -> u32 {
    if capacity.cpu == 0 || capacity.memory_gib == 0 || capacity.disk_gib == 0 {
        warn!(%capacity, "runner reports zero capacity, scoring 0");
        return 0;
    }
    if usage.cpu < 0.0 || usage.memory < 0.0 || usage.disk < 0.0 {
        warn!(?usage, "runner reports negative usage, scoring 0");
        return 0;
    }

    let weights = [
        cfg.cpu_usage_weight,
        cfg.memory_usage_weight,
        cfg.disk_usage_weight,
        cfg.allocated_cpu_weight,
        cfg.allocated_memory_weight,
        cfg.allocated_disk_weight,
    ];
    let current = [
        usage.cpu,
        usage.memory,
        usage.disk,
        ratio(allocated.cpu, capacity.cpu),
        ratio(allocated.memory_gib, capacity.memory_gib),
        ratio(allocated.disk_gib, capacity.disk_gib),
    ];

    let mut to_ideal = 0.0;
    let mut to_anti = 0.0;
    for i in 0..current.len() {
        let c = current[i] / 100.0;
        to_ideal += weights[i] * (c - IDEAL[i] / 100.0).powi(2);
        to_anti += weights[i] * (c - ANTI_IDEAL[i] / 100.0).powi(2);
    }
    let (to_ideal, to_anti) = (to_ideal.sqrt(), to_anti.sqrt());
    if to_ideal + to_anti == 0.0 {
        return 0;
    }
    let mut score = to_anti / (to_ideal + to_anti);

    for (used, threshold, exponent) in [
        (usage.cpu, cfg.cpu_penalty_threshold, cfg.cpu_penalty_exponent),
        (usage.memory, cfg.memory_penalty_threshold, cfg.memory_penalty_exponent),
        (usage.disk, cfg.disk_penalty_threshold, cfg.disk_penalty_exponent),
    ] {
        if used >= threshold {
            score *= (-exponent * (used - threshold)).exp();
        }
    }

    (score * 100.0).round().clamp(0.0, 100.0) as u32
}
