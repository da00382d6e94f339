//! Runner allocation audit.
//!
//! Reservations are taken on the runner row and recorded on the sandbox row
//! in two separate writes. A crash between them leaks a reservation or
//! returns one twice. The audit recomputes what each runner should hold from
//! the sandboxes placed on it and repairs counters whose drift stayed the
//! same across two consecutive passes. A reservation still in flight
//! changes the counters between passes and is left alone; the repair itself
//! is a compare-and-set on the counters read.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    corral_common::{Resources, Tick},
    corral_registry::RegistryStore,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{Result, store::SandboxStore, types::Sandbox};

/// What the sandboxes placed on one runner hold there: the resources of
/// every sandbox that occupies it plus the growth of pending resizes.
pub fn expected_allocation(sandboxes: &[Sandbox]) -> Resources {
    sandboxes
        .iter()
        .fold(Resources::default(), |mut total, sandbox| {
            if sandbox.state.occupies_runner() {
                total = total.saturating_add(&sandbox.resources);
            }
            if let Some(pending) = &sandbox.pending_resources {
                total = total.saturating_add(&sandbox.resources.growth_to(pending));
            }
            total
        })
}

#[derive(Debug, Clone)]
struct Drift {
    recorded: Resources,
    expected: Resources,
}

impl Drift {
    fn same_as(&self, other: &Drift) -> bool {
        self.recorded.same_amount(&other.recorded) && self.expected.same_amount(&other.expected)
    }
}

pub struct AllocationAudit {
    sandboxes: Arc<dyn SandboxStore>,
    registry: Arc<dyn RegistryStore>,
    suspects: Mutex<HashMap<String, Drift>>,
}

impl AllocationAudit {
    pub fn new(sandboxes: Arc<dyn SandboxStore>, registry: Arc<dyn RegistryStore>) -> Self {
        Self {
            sandboxes,
            registry,
            suspects: Mutex::new(HashMap::new()),
        }
    }

    /// Check every runner once. Returns how many counters were repaired.
    pub async fn run(&self) -> Result<usize> {
        let mut suspects = self.suspects.lock().await;
        let mut repaired = 0;
        let runners = self.registry.list_runners().await?;
        suspects.retain(|id, _| runners.iter().any(|r| &r.id == id));

        for runner in runners {
            let placed = self.sandboxes.list_on_runner(&runner.id).await?;
            let drift = Drift {
                recorded: runner.allocated.clone(),
                expected: expected_allocation(&placed),
            };
            if drift.recorded.same_amount(&drift.expected) {
                suspects.remove(&runner.id);
                continue;
            }
            match suspects.get(&runner.id) {
                Some(previous) if previous.same_as(&drift) => {
                    suspects.remove(&runner.id);
                    if self
                        .registry
                        .reset_allocated(&runner.id, &drift.recorded, &drift.expected)
                        .await?
                    {
                        warn!(
                            runner_id = %runner.id,
                            recorded = %drift.recorded,
                            expected = %drift.expected,
                            "runner allocation repaired"
                        );
                        repaired += 1;
                    }
                },
                _ => {
                    debug!(runner_id = %runner.id, recorded = %drift.recorded, expected = %drift.expected, "allocation drift observed");
                    suspects.insert(runner.id.clone(), drift);
                },
            }
        }
        Ok(repaired)
    }
}

#[async_trait]
impl Tick for AllocationAudit {
    fn name(&self) -> &'static str {
        "allocation-audit"
    }

    async fn tick(&self) {
        match self.run().await {
            Ok(0) => {},
            Ok(repaired) => info!(repaired, "allocation audit done"),
            Err(e) => warn!(error = %e, "allocation audit failed"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            store_memory::InMemorySandboxStore,
            types::{NewSandbox, SandboxState},
        },
        corral_registry::{InMemoryRegistryStore, Runner, RunnerClass},
    };

    fn placed(name: &str, state: SandboxState, resources: Resources) -> Sandbox {
        let mut request = NewSandbox::new("org", name, "eu");
        request.resources = resources;
        let mut sandbox = request.into_sandbox();
        sandbox.state = state;
        sandbox.runner_id = Some("r1".into());
        sandbox
    }

    async fn audit(sandboxes: &[Sandbox]) -> (AllocationAudit, Arc<InMemoryRegistryStore>) {
        let store = Arc::new(InMemorySandboxStore::new());
        for sandbox in sandboxes {
            store.insert(sandbox).await.unwrap();
        }
        let registry = Arc::new(InMemoryRegistryStore::new());
        registry
            .insert_runner(&Runner::new("r1", "eu", RunnerClass::Linux, Resources::new(16, 64, 500)))
            .await
            .unwrap();
        (AllocationAudit::new(store, registry.clone()), registry)
    }

    async fn allocated(registry: &InMemoryRegistryStore) -> Resources {
        registry.get_runner("r1").await.unwrap().unwrap().allocated
    }

    #[test]
    fn archived_sandboxes_hold_nothing_and_resizes_hold_their_growth() {
        let mut resizing = placed("a", SandboxState::Resizing, Resources::new(2, 4, 10));
        resizing.pending_resources = Some(Resources::new(4, 4, 20));
        let sandboxes = [
            resizing,
            placed("b", SandboxState::Stopped, Resources::new(1, 1, 3)),
            placed("c", SandboxState::Archived, Resources::new(8, 8, 8)),
        ];
        assert!(expected_allocation(&sandboxes).same_amount(&Resources::new(5, 5, 23)));
    }

    #[tokio::test]
    async fn leaked_reservation_is_repaired_on_the_second_pass() {
        let sandbox = placed("a", SandboxState::Started, Resources::new(2, 4, 10));
        let (audit, registry) = audit(std::slice::from_ref(&sandbox)).await;
        registry.try_reserve("r1", &sandbox.resources).await.unwrap();
        // Reserved for a sandbox whose placement was never recorded.
        registry.try_reserve("r1", &Resources::new(1, 1, 3)).await.unwrap();

        assert_eq!(audit.run().await.unwrap(), 0);
        assert!(allocated(&registry).await.same_amount(&Resources::new(3, 5, 13)));
        assert_eq!(audit.run().await.unwrap(), 1);
        assert!(allocated(&registry).await.same_amount(&sandbox.resources));
        assert_eq!(audit.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_release_is_restored() {
        let sandbox = placed("a", SandboxState::Stopped, Resources::new(2, 4, 10));
        let (audit, registry) = audit(std::slice::from_ref(&sandbox)).await;
        registry.try_reserve("r1", &sandbox.resources).await.unwrap();
        registry.release("r1", &sandbox.resources).await.unwrap();

        audit.run().await.unwrap();
        assert_eq!(audit.run().await.unwrap(), 1);
        assert!(allocated(&registry).await.same_amount(&sandbox.resources));
    }

    #[tokio::test]
    async fn moving_counters_are_left_alone() {
        let (audit, registry) = audit(&[]).await;
        registry.try_reserve("r1", &Resources::new(1, 1, 1)).await.unwrap();
        audit.run().await.unwrap();
        // Another reservation lands between passes.
        registry.try_reserve("r1", &Resources::new(1, 1, 1)).await.unwrap();

        assert_eq!(audit.run().await.unwrap(), 0);
        assert!(allocated(&registry).await.same_amount(&Resources::new(2, 2, 2)));
    }
}
