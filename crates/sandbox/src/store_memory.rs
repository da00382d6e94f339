//! In-memory sandbox and warm pool stores.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::{SandboxStore, WarmPoolStore},
    types::{Sandbox, SandboxState},
    warm_pool::WarmPool,
};

fn is_live(sandbox: &Sandbox) -> bool {
    sandbox.state != SandboxState::Destroyed
}

fn by_age(mut sandboxes: Vec<Sandbox>) -> Vec<Sandbox> {
    sandboxes.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    sandboxes
}

#[derive(Default)]
pub struct InMemorySandboxStore {
    sandboxes: Mutex<HashMap<String, Sandbox>>,
}

impl InMemorySandboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Sandbox>) -> R) -> R {
        let mut sandboxes = self.sandboxes.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut sandboxes)
    }

    fn filtered(&self, keep: impl Fn(&Sandbox) -> bool) -> Vec<Sandbox> {
        self.with(|sandboxes| {
            sandboxes
                .values()
                .filter(|s| is_live(s) && keep(s))
                .cloned()
                .collect()
        })
    }
}

#[async_trait]
impl SandboxStore for InMemorySandboxStore {
    async fn insert(&self, sandbox: &Sandbox) -> Result<()> {
        self.with(|sandboxes| {
            let taken = sandboxes.values().any(|s| {
                is_live(s) && s.organization_id == sandbox.organization_id && s.name == sandbox.name
            });
            if taken {
                return Err(Error::conflict(format!(
                    "sandbox with name {} already exists",
                    sandbox.name
                )));
            }
            sandboxes.insert(sandbox.id.clone(), sandbox.clone());
            Ok(())
        })
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<()> {
        self.with(|sandboxes| {
            let renamed_onto_taken = is_live(sandbox)
                && sandboxes.values().any(|s| {
                    s.id != sandbox.id
                        && is_live(s)
                        && s.organization_id == sandbox.organization_id
                        && s.name == sandbox.name
                });
            if renamed_onto_taken {
                return Err(Error::conflict(format!(
                    "sandbox with name {} already exists",
                    sandbox.name
                )));
            }
            match sandboxes.get_mut(&sandbox.id) {
                Some(existing) => {
                    *existing = sandbox.clone();
                    Ok(())
                },
                None => Err(Error::not_found(&sandbox.id)),
            }
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Sandbox>> {
        Ok(self.with(|sandboxes| sandboxes.get(id).cloned()))
    }

    async fn find_by_name(&self, organization_id: &str, name: &str) -> Result<Option<Sandbox>> {
        Ok(self
            .filtered(|s| s.organization_id == organization_id && s.name == name)
            .pop())
    }

    async fn list(&self, organization_id: &str) -> Result<Vec<Sandbox>> {
        Ok(by_age(
            self.filtered(|s| s.organization_id == organization_id),
        ))
    }

    async fn list_on_runner(&self, runner_id: &str) -> Result<Vec<Sandbox>> {
        Ok(by_age(
            self.filtered(|s| s.runner_id.as_deref() == Some(runner_id)),
        ))
    }

    async fn list_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<Sandbox>> {
        let mut page = self.filtered(|s| after.is_none_or(|a| s.id.as_str() > a));
        page.sort_by(|a, b| a.id.cmp(&b.id));
        page.truncate(limit);
        Ok(page)
    }

    async fn list_pool_members(&self, pool_id: &str) -> Result<Vec<Sandbox>> {
        Ok(by_age(
            self.filtered(|s| s.pool_id.as_deref() == Some(pool_id)),
        ))
    }
}

#[derive(Default)]
pub struct InMemoryWarmPoolStore {
    pools: Mutex<HashMap<String, WarmPool>>,
}

impl InMemoryWarmPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, WarmPool>) -> R) -> R {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut pools)
    }
}

#[async_trait]
impl WarmPoolStore for InMemoryWarmPoolStore {
    async fn upsert_pool(&self, pool: &WarmPool) -> Result<()> {
        self.with(|pools| {
            pools.insert(pool.id.clone(), pool.clone());
        });
        Ok(())
    }

    async fn get_pool(&self, id: &str) -> Result<Option<WarmPool>> {
        Ok(self.with(|pools| pools.get(id).cloned()))
    }

    async fn list_pools(&self) -> Result<Vec<WarmPool>> {
        let mut pools: Vec<WarmPool> = self.with(|pools| pools.values().cloned().collect());
        pools.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        Ok(pools)
    }

    async fn list_pools_for(&self, organization_id: &str) -> Result<Vec<WarmPool>> {
        let mut pools = self.list_pools().await?;
        pools.retain(|p| p.organization_id == organization_id);
        Ok(pools)
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.with(|pools| pools.remove(id));
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::types::NewSandbox};

    fn sandbox(name: &str) -> Sandbox {
        NewSandbox::new("org", name, "eu").into_sandbox()
    }

    #[tokio::test]
    async fn names_are_unique_among_live_sandboxes() {
        let store = InMemorySandboxStore::new();
        let mut first = sandbox("dev");
        store.insert(&first).await.unwrap();
        assert!(matches!(
            store.insert(&sandbox("dev")).await,
            Err(Error::Conflict(_))
        ));

        first.state = SandboxState::Destroyed;
        store.update(&first).await.unwrap();
        store.insert(&sandbox("dev")).await.unwrap();
        assert_eq!(store.list("org").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pages_walk_every_live_sandbox_once() {
        let store = InMemorySandboxStore::new();
        for i in 0..7 {
            store.insert(&sandbox(&format!("sb-{i}"))).await.unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store.list_page(cursor.as_deref(), 3).await.unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(last.id.clone());
            seen.extend(page.into_iter().map(|s| s.id));
        }
        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn runner_and_pool_listings() {
        let store = InMemorySandboxStore::new();
        let mut placed = sandbox("a");
        placed.runner_id = Some("r1".into());
        placed.pool_id = Some("p1".into());
        store.insert(&placed).await.unwrap();
        store.insert(&sandbox("b")).await.unwrap();

        assert_eq!(store.list_on_runner("r1").await.unwrap().len(), 1);
        assert_eq!(store.list_pool_members("p1").await.unwrap().len(), 1);
        assert!(store.list_pool_members("p2").await.unwrap().is_empty());
    }
}
