//! Warm pools: standing inventories of idle, started sandboxes of one shape.
//!
//! A creation request is served from a pool only when its shape key matches
//! the pool's exactly. Claiming and replenishing live on the
//! [`SandboxManager`](crate::SandboxManager); this module holds the shape and
//! the replenisher tick.

use std::{collections::BTreeMap, sync::Arc};

use {
    async_trait::async_trait,
    corral_common::{Resources, Tick, now_ms},
    corral_registry::RunnerClass,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{manager::SandboxManager, types::NewSandbox};

/// Every dimension a pooled sandbox must share with a request to serve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub organization_id: String,
    pub snapshot: Option<String>,
    pub region: String,
    pub class: RunnerClass,
    pub resources: Resources,
    pub os_user: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPool {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    pub region: String,
    pub class: RunnerClass,
    pub resources: Resources,
    pub os_user: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Idle sandboxes to keep.
    pub size: u32,
    /// Why the last replenishment stopped short.
    #[serde(default)]
    pub error_reason: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl WarmPool {
    /// A pool serving requests shaped like `template`.
    pub fn new(template: &NewSandbox, size: u32) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: template.organization_id.clone(),
            snapshot: template.snapshot.clone(),
            region: template.region.clone(),
            class: template.class,
            resources: template.resources.clone(),
            os_user: template.os_user.clone(),
            env: template.env.clone(),
            size,
            error_reason: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn key(&self) -> PoolKey {
        PoolKey {
            organization_id: self.organization_id.clone(),
            snapshot: self.snapshot.clone(),
            region: self.region.clone(),
            class: self.class,
            resources: self.resources.clone(),
            os_user: self.os_user.clone(),
            env: self.env.clone(),
        }
    }

    /// Request for one more member. Members never auto-stop or auto-archive.
    pub(crate) fn member_request(&self) -> NewSandbox {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut request = NewSandbox::new(
            &self.organization_id,
            format!("pool-{}-{}", short(&self.id), short(&suffix)),
            &self.region,
        );
        request.class = self.class;
        request.snapshot = self.snapshot.clone();
        request.resources = self.resources.clone();
        request.os_user = self.os_user.clone();
        request.env = self.env.clone();
        request.auto_stop_minutes = 0;
        request.auto_archive_minutes = 0;
        request.auto_delete_minutes = -1;
        request
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

impl NewSandbox {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            organization_id: self.organization_id.clone(),
            snapshot: self.snapshot.clone(),
            region: self.region.clone(),
            class: self.class,
            resources: self.resources.clone(),
            os_user: self.os_user.clone(),
            env: self.env.clone(),
        }
    }
}

/// Tops every pool back up to its size.
pub struct WarmPoolReplenisher {
    manager: Arc<SandboxManager>,
}

impl WarmPoolReplenisher {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tick for WarmPoolReplenisher {
    fn name(&self) -> &'static str {
        "warm-pool"
    }

    async fn tick(&self) {
        match self.manager.replenish_pools().await {
            Ok(0) => {},
            Ok(created) => debug!(created, "warm pools replenished"),
            Err(e) => warn!(error = %e, "warm pool replenishment failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn template() -> NewSandbox {
        let mut request = NewSandbox::new("org", "sb", "eu");
        request.snapshot = Some("base".into());
        request.resources = Resources::new(2, 4, 10);
        request.env.insert("LANG".into(), "C".into());
        request
    }

    #[test]
    fn identical_shape_matches() {
        let pool = WarmPool::new(&template(), 2);
        let mut other = template();
        other.name = "another-name".into();
        other.auto_stop_minutes = 60;
        assert_eq!(pool.key(), other.pool_key());
    }

    #[rstest]
    #[case::cpu(|r: &mut NewSandbox| r.resources.cpu = 4)]
    #[case::memory(|r: &mut NewSandbox| r.resources.memory_gib = 8)]
    #[case::gpu(|r: &mut NewSandbox| r.resources.gpu = 1)]
    #[case::snapshot(|r: &mut NewSandbox| r.snapshot = None)]
    #[case::region(|r: &mut NewSandbox| r.region = "us".into())]
    #[case::class(|r: &mut NewSandbox| r.class = RunnerClass::LinuxExp)]
    #[case::os_user(|r: &mut NewSandbox| r.os_user = "root".into())]
    #[case::env(|r: &mut NewSandbox| {
        r.env.insert("DEBUG".into(), "1".into());
    })]
    #[case::organization(|r: &mut NewSandbox| r.organization_id = "other".into())]
    fn any_differing_dimension_misses(#[case] mutate: fn(&mut NewSandbox)) {
        let pool = WarmPool::new(&template(), 2);
        let mut request = template();
        mutate(&mut request);
        assert_ne!(pool.key(), request.pool_key());
    }

    #[test]
    fn members_are_exempt_from_sweeps() {
        let member = WarmPool::new(&template(), 1).member_request();
        assert_eq!(member.auto_stop_minutes, 0);
        assert_eq!(member.auto_archive_minutes, 0);
        assert!(member.auto_delete_minutes < 0);
        assert_eq!(member.pool_key(), template().pool_key());
    }
}
