//! Runner selection.
//!
//! Candidates are filtered on placement constraints, ranked by a composite of
//! availability score, action-load penalty and live utilization, and then
//! reserved in rank order with a conditional increment. The first successful
//! reservation wins; if none succeeds no counter has moved.

use std::sync::Arc;

use {
    corral_common::Resources,
    corral_config::AllocatorConfig,
    tracing::{debug, info},
};

use crate::{
    AllocationError, Result,
    store::RegistryStore,
    types::{Runner, RunnerClass},
};

#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub resources: Resources,
    pub region: String,
    pub class: RunnerClass,
    pub experimental: bool,
    pub organization_id: String,
    /// Only runners owned by `organization_id` qualify.
    pub dedicated_only: bool,
    pub excluded_runner_ids: Vec<String>,
}

impl PlacementRequest {
    pub fn new(resources: Resources, region: impl Into<String>, class: RunnerClass) -> Self {
        Self {
            resources,
            region: region.into(),
            class,
            experimental: class.is_experimental(),
            organization_id: String::new(),
            dedicated_only: false,
            excluded_runner_ids: Vec::new(),
        }
    }
}

pub struct RunnerAllocator {
    store: Arc<dyn RegistryStore>,
    config: AllocatorConfig,
}

impl RunnerAllocator {
    pub fn new(store: Arc<dyn RegistryStore>, config: AllocatorConfig) -> Self {
        Self { store, config }
    }

    /// Higher is better.
    pub fn ranking_score(&self, runner: &Runner) -> f64 {
        f64::from(runner.availability_score)
            - f64::from(runner.action_load_penalty)
            - self.config.utilization_weight * runner.usage.mean()
    }

    fn qualifies(&self, runner: &Runner, req: &PlacementRequest) -> bool {
        let owner_ok = match &runner.organization_id {
            Some(owner) => *owner == req.organization_id,
            None => !req.dedicated_only,
        };
        let gpu_ok = match req.resources.gpu_type.as_deref() {
            Some(wanted) if req.resources.gpu > 0 && !wanted.is_empty() => runner
                .capacity
                .gpu_type
                .as_deref()
                .is_some_and(|kind| kind.eq_ignore_ascii_case(wanted)),
            _ => true,
        };
        runner.region == req.region
            && runner.class == req.class
            && gpu_ok
            && runner.experimental == req.experimental
            && owner_ok
            && runner.is_schedulable(self.config.availability_score_threshold)
            && !req.excluded_runner_ids.contains(&runner.id)
            && req.resources.fits_within(&runner.free())
    }

    /// Qualifying runners, best first. Deterministic for identical inputs.
    pub fn rank<'a>(&self, runners: &'a [Runner], req: &PlacementRequest) -> Vec<&'a Runner> {
        let mut candidates: Vec<&Runner> = runners.iter().filter(|r| self.qualifies(r, req)).collect();
        candidates.sort_by(|a, b| {
            self.ranking_score(b)
                .total_cmp(&self.ranking_score(a))
                .then_with(|| a.allocated.total().cmp(&b.allocated.total()))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Pick a runner and reserve `req.resources` on it.
    pub async fn allocate(&self, req: &PlacementRequest) -> std::result::Result<Runner, AllocationError> {
        let runners = self.store.list_runners().await?;
        let ranked = self.rank(&runners, req);
        debug!(
            region = %req.region,
            class = %req.class,
            candidates = ranked.len(),
            requested = %req.resources,
            "allocating runner"
        );

        for runner in ranked.into_iter().take(self.config.candidate_limit.max(1)) {
            if self.store.try_reserve(&runner.id, &req.resources).await? {
                let mut placed = runner.clone();
                placed.allocated = placed.allocated.saturating_add(&req.resources);
                info!(runner_id = %placed.id, requested = %req.resources, "runner allocated");
                return Ok(placed);
            }
            debug!(runner_id = %runner.id, "lost reservation race, trying next runner");
        }

        Err(AllocationError::CapacityExhausted {
            requested: req.resources.clone(),
            region: req.region.clone(),
            class: req.class.to_string(),
        })
    }

    /// Reserve extra capacity on a specific runner, e.g. to grow a sandbox in
    /// place. Never looks at other runners.
    pub async fn reserve_on(
        &self,
        runner: &Runner,
        growth: &Resources,
    ) -> std::result::Result<(), AllocationError> {
        if growth.is_zero() || self.store.try_reserve(&runner.id, growth).await? {
            return Ok(());
        }
        Err(AllocationError::CapacityExhausted {
            requested: growth.clone(),
            region: runner.region.clone(),
            class: runner.class.to_string(),
        })
    }

    /// Return a sandbox's reservation to its runner.
    pub async fn release(&self, runner_id: &str, amount: &Resources) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.store.release(runner_id, amount).await?;
        debug!(runner_id, released = %amount, "capacity released");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{store_memory::InMemoryRegistryStore, types::RunnerState},
        rstest::rstest,
    };

    fn ready(id: &str, cap: Resources, score: u32) -> Runner {
        let mut r = Runner::new(id, "eu", RunnerClass::Linux, cap);
        r.state = RunnerState::Ready;
        r.availability_score = score;
        r
    }

    async fn allocator(runners: Vec<Runner>) -> (RunnerAllocator, Arc<InMemoryRegistryStore>) {
        let store = Arc::new(InMemoryRegistryStore::new());
        for r in &runners {
            store.insert_runner(r).await.unwrap();
        }
        (RunnerAllocator::new(store.clone(), AllocatorConfig::default()), store)
    }

    fn req(cpu: u32) -> PlacementRequest {
        PlacementRequest::new(Resources::new(cpu, 2, 10), "eu", RunnerClass::Linux)
    }

    #[tokio::test]
    async fn picks_highest_score() {
        let (alloc, store) = allocator(vec![
            ready("a", Resources::new(8, 32, 100), 50),
            ready("b", Resources::new(8, 32, 100), 80),
        ])
        .await;
        let placed = alloc.allocate(&req(2)).await.unwrap();
        assert_eq!(placed.id, "b");
        let b = store.get_runner("b").await.unwrap().unwrap();
        assert_eq!(b.allocated, Resources::new(2, 2, 10));
    }

    #[tokio::test]
    async fn action_load_penalty_sheds_placements() {
        let mut busy = ready("a", Resources::new(8, 32, 100), 80);
        busy.action_load_penalty = 40;
        let (alloc, _) = allocator(vec![busy, ready("b", Resources::new(8, 32, 100), 60)]).await;
        assert_eq!(alloc.allocate(&req(1)).await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn ties_break_on_allocated_then_id() {
        let mut a = ready("a", Resources::new(8, 32, 100), 70);
        a.allocated = Resources::new(2, 2, 2);
        let c = ready("c", Resources::new(8, 32, 100), 70);
        let b = ready("b", Resources::new(8, 32, 100), 70);
        let runners = vec![a, c, b];
        let (alloc, _) = allocator(Vec::new()).await;
        let ranked: Vec<_> = alloc.rank(&runners, &req(1)).iter().map(|r| r.id.clone()).collect();
        assert_eq!(ranked, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn exhaustion_leaves_counters_untouched() {
        let mut a = ready("a", Resources::new(8, 32, 100), 70);
        a.allocated = Resources::new(4, 0, 0);
        let mut b = ready("b", Resources::new(4, 32, 100), 70);
        b.allocated = Resources::new(1, 0, 0);
        let (alloc, store) = allocator(vec![a, b]).await;
        let err = alloc.allocate(&req(8)).await.unwrap_err();
        assert!(err.is_capacity_exhausted());
        assert_eq!(
            store.get_runner("a").await.unwrap().unwrap().allocated,
            Resources::new(4, 0, 0)
        );
        assert_eq!(
            store.get_runner("b").await.unwrap().unwrap().allocated,
            Resources::new(1, 0, 0)
        );
    }

    #[rstest]
    #[case::draining(|r: &mut Runner| r.draining = true)]
    #[case::unresponsive(|r: &mut Runner| r.state = RunnerState::Unresponsive)]
    #[case::low_score(|r: &mut Runner| r.availability_score = 5)]
    #[case::other_region(|r: &mut Runner| r.region = "us".into())]
    #[case::experimental(|r: &mut Runner| r.experimental = true)]
    #[case::dedicated_elsewhere(|r: &mut Runner| r.organization_id = Some("other-org".into()))]
    fn filtered_out(#[case] mutate: fn(&mut Runner)) {
        let mut runner = ready("a", Resources::new(8, 32, 100), 70);
        mutate(&mut runner);
        let alloc = RunnerAllocator::new(
            Arc::new(InMemoryRegistryStore::new()),
            AllocatorConfig::default(),
        );
        assert!(alloc.rank(&[runner], &req(1)).is_empty());
    }

    #[rstest]
    #[case::same_type(Some("h100"), true)]
    #[case::case_insensitive(Some("H100"), true)]
    #[case::other_type(Some("a100"), false)]
    #[case::untyped_runner(None, false)]
    fn requested_gpu_type_must_match(#[case] runner_gpu: Option<&str>, #[case] ranked: bool) {
        let mut cap = Resources::new(8, 32, 100);
        cap.gpu = 4;
        cap.gpu_type = runner_gpu.map(str::to_string);
        let runner = ready("gpu", cap, 70);
        let alloc = RunnerAllocator::new(
            Arc::new(InMemoryRegistryStore::new()),
            AllocatorConfig::default(),
        );
        let request = PlacementRequest::new(
            Resources::new(1, 2, 10).with_gpu(1, "h100"),
            "eu",
            RunnerClass::Linux,
        );
        assert_eq!(alloc.rank(&[runner.clone()], &request).len(), usize::from(ranked));

        // Without a type any GPU runner will do.
        let mut untyped = request.clone();
        untyped.resources.gpu_type = None;
        assert_eq!(alloc.rank(&[runner], &untyped).len(), 1);
    }

    #[test]
    fn dedicated_only_requires_owned_runner() {
        let alloc = RunnerAllocator::new(
            Arc::new(InMemoryRegistryStore::new()),
            AllocatorConfig::default(),
        );
        let shared = ready("shared", Resources::new(8, 32, 100), 90);
        let mut owned = ready("owned", Resources::new(8, 32, 100), 20);
        owned.organization_id = Some("org-1".into());
        let runners = vec![shared, owned];

        let mut request = req(1);
        request.organization_id = "org-1".into();
        assert_eq!(alloc.rank(&runners, &request).len(), 2);

        request.dedicated_only = true;
        let ranked = alloc.rank(&runners, &request);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "owned");
    }

    #[test]
    fn experimental_class_needs_experimental_runner() {
        let alloc = RunnerAllocator::new(
            Arc::new(InMemoryRegistryStore::new()),
            AllocatorConfig::default(),
        );
        let mut exp = Runner::new("x", "eu", RunnerClass::LinuxExp, Resources::new(8, 8, 80));
        exp.state = RunnerState::Ready;
        exp.availability_score = 60;
        let request = PlacementRequest::new(Resources::new(1, 1, 1), "eu", RunnerClass::LinuxExp);
        assert_eq!(alloc.rank(std::slice::from_ref(&exp), &request).len(), 1);
        assert!(alloc.rank(&[exp], &req(1)).is_empty());
    }

    #[tokio::test]
    async fn resize_reserves_only_on_current_runner() {
        let mut small = ready("small", Resources::new(4, 8, 40), 70);
        small.allocated = Resources::new(3, 4, 20);
        let big = ready("big", Resources::new(64, 256, 1000), 95);
        let (alloc, store) = allocator(vec![small.clone(), big]).await;

        let err = alloc
            .reserve_on(&small, &Resources::new(2, 0, 0))
            .await
            .unwrap_err();
        assert!(err.is_capacity_exhausted());
        assert!(
            store
                .get_runner("big")
                .await
                .unwrap()
                .unwrap()
                .allocated
                .is_zero()
        );

        alloc.reserve_on(&small, &Resources::new(1, 4, 0)).await.unwrap();
        assert_eq!(
            store.get_runner("small").await.unwrap().unwrap().allocated,
            Resources::new(4, 8, 20)
        );
    }
}
