//! Resource shape shared by sandboxes, runners, snapshots and warm pools.

use serde::{Deserialize, Serialize};

/// Compute resources requested by a sandbox or held free on a runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub cpu: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
}

impl Resources {
    #[must_use]
    pub fn new(cpu: u32, memory_gib: u32, disk_gib: u32) -> Self {
        Self {
            cpu,
            memory_gib,
            disk_gib,
            gpu: 0,
            gpu_type: None,
        }
    }

    #[must_use]
    pub fn with_gpu(mut self, gpu: u32, gpu_type: impl Into<String>) -> Self {
        self.gpu = gpu;
        self.gpu_type = Some(gpu_type.into());
        self
    }

    /// True when every dimension of `self` is no larger than `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu
            && self.memory_gib <= available.memory_gib
            && self.disk_gib <= available.disk_gib
            && self.gpu <= available.gpu
    }

    /// Per-dimension growth from `self` to `target`; shrinking dimensions yield 0.
    #[must_use]
    pub fn growth_to(&self, target: &Resources) -> Resources {
        Resources {
            cpu: target.cpu.saturating_sub(self.cpu),
            memory_gib: target.memory_gib.saturating_sub(self.memory_gib),
            disk_gib: target.disk_gib.saturating_sub(self.disk_gib),
            gpu: target.gpu.saturating_sub(self.gpu),
            gpu_type: None,
        }
    }

    /// Per-dimension reduction from `self` to `target`; growing dimensions yield 0.
    #[must_use]
    pub fn shrink_to(&self, target: &Resources) -> Resources {
        target.growth_to(self)
    }

    /// `self - other` per dimension, flooring at zero. Keeps `self.gpu_type`.
    #[must_use]
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_gib: self.memory_gib.saturating_sub(other.memory_gib),
            disk_gib: self.disk_gib.saturating_sub(other.disk_gib),
            gpu: self.gpu.saturating_sub(other.gpu),
            gpu_type: self.gpu_type.clone(),
        }
    }

    #[must_use]
    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            memory_gib: self.memory_gib.saturating_add(other.memory_gib),
            disk_gib: self.disk_gib.saturating_add(other.disk_gib),
            gpu: self.gpu.saturating_add(other.gpu),
            gpu_type: self.gpu_type.clone(),
        }
    }

    /// Sum of cpu, memory and disk; used to break allocation ties.
    pub fn total(&self) -> u64 {
        u64::from(self.cpu) + u64::from(self.memory_gib) + u64::from(self.disk_gib)
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory_gib == 0 && self.disk_gib == 0 && self.gpu == 0
    }

    /// Equal in every counted dimension; `gpu_type` is ignored.
    pub fn same_amount(&self, other: &Resources) -> bool {
        self.cpu == other.cpu
            && self.memory_gib == other.memory_gib
            && self.disk_gib == other.disk_gib
            && self.gpu == other.gpu
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} mem={}GiB disk={}GiB",
            self.cpu, self.memory_gib, self.disk_gib
        )?;
        if self.gpu > 0 {
            write!(f, " gpu={}", self.gpu)?;
            if let Some(kind) = &self.gpu_type {
                write!(f, "({kind})")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_requires_every_dimension() {
        let free = Resources::new(4, 8, 20);
        assert!(Resources::new(4, 8, 20).fits_within(&free));
        assert!(!Resources::new(8, 1, 1).fits_within(&free));
        assert!(!Resources::new(1, 1, 21).fits_within(&free));
        assert!(!Resources::new(1, 1, 1).with_gpu(1, "a100").fits_within(&free));
    }

    #[test]
    fn growth_and_shrink_are_per_dimension() {
        let current = Resources::new(2, 4, 10);
        let target = Resources::new(4, 2, 10);
        assert_eq!(current.growth_to(&target), Resources::new(2, 0, 0));
        assert_eq!(current.shrink_to(&target), Resources::new(0, 2, 0));
        assert!(current.growth_to(&current).is_zero());
    }

    #[test]
    fn sub_floors_at_zero() {
        let a = Resources::new(2, 4, 10);
        assert_eq!(a.saturating_sub(&Resources::new(3, 1, 10)), Resources::new(0, 3, 0));
        assert_eq!(a.saturating_add(&a), Resources::new(4, 8, 20));
        assert_eq!(a.total(), 16);
        assert!(a.same_amount(&a.clone().with_gpu(0, "h100")));
        assert!(!a.same_amount(&Resources::new(2, 4, 11)));
    }
}
