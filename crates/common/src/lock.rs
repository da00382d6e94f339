//! Named lease locks.
//!
//! A lock is a lease on a string key held by an owner token until it is
//! released or its TTL runs out. Every state-changing operation on a sandbox
//! holds `sandbox:{id}:state-change` while it reads the current state and
//! writes the next one.
//!
//! A live guard renews its lease every third of the TTL, so an operation may
//! outlast the TTL while its holder is alive. A crashed holder stops renewing
//! and the lease expires one TTL later.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::{task::JoinHandle, time::Instant},
    tracing::{debug, warn},
};

use crate::{Error, Result};

/// Backend that stores leases.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take `key` for `ttl` on behalf of `token`. Returns `false` when another
    /// token holds a lease that has not expired yet.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` if it is still held by `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<()>;
}

pub fn sandbox_lock_key(sandbox_id: &str) -> String {
    format!("sandbox:{sandbox_id}:state-change")
}

pub fn disk_lock_key(disk_id: &str) -> String {
    format!("disk:{disk_id}:state-change")
}

pub fn snapshot_lock_key(snapshot_id: &str) -> String {
    format!("snapshot:{snapshot_id}:state-change")
}

/// A held lease. Dropping the guard without calling [`LockGuard::release`]
/// schedules the release on the current runtime.
pub struct LockGuard {
    key: String,
    token: String,
    provider: Arc<dyn LockProvider>,
    renewal: JoinHandle<()>,
    released: bool,
}

impl LockGuard {
    fn new(provider: &Arc<dyn LockProvider>, key: &str, token: String, ttl: Duration) -> Self {
        let renewal = tokio::spawn(renew(
            Arc::clone(provider),
            key.to_string(),
            token.clone(),
            ttl,
        ));
        Self {
            key: key.to_string(),
            token,
            provider: Arc::clone(provider),
            renewal,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.renewal.abort();
        let _ = (&mut self.renewal).await;
        self.provider.unlock(&self.key, &self.token).await
    }
}

/// Extend the lease held by `token` until the task is aborted or another
/// owner took the key over.
async fn renew(provider: Arc<dyn LockProvider>, key: String, token: String, ttl: Duration) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match provider.try_lock(&key, &token, ttl).await {
            Ok(true) => {},
            Ok(false) => {
                warn!(key = %key, "lease taken over by another owner, renewal stopped");
                return;
            },
            Err(e) => warn!(key = %key, error = %e, "failed to renew lease"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        if self.released {
            return;
        }
        let provider = Arc::clone(&self.provider);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = provider.unlock(&key, &token).await {
                        warn!(key = %key, error = %e, "failed to release dropped lock");
                    }
                });
            },
            Err(_) => warn!(key = %key, "lock dropped outside a runtime, lease left to expire"),
        }
    }
}

/// Take `key` once without waiting. Background sweeps use this so they skip
/// sandboxes a user request is already working on.
pub async fn try_acquire(
    provider: &Arc<dyn LockProvider>,
    key: &str,
    ttl: Duration,
) -> Result<Option<LockGuard>> {
    let token = uuid::Uuid::new_v4().to_string();
    if provider.try_lock(key, &token, ttl).await? {
        Ok(Some(LockGuard::new(provider, key, token, ttl)))
    } else {
        Ok(None)
    }
}

/// Take `key`, polling until it frees up or `wait` elapses.
pub async fn acquire(
    provider: &Arc<dyn LockProvider>,
    key: &str,
    ttl: Duration,
    wait: Duration,
) -> Result<LockGuard> {
    let started = Instant::now();
    let mut backoff = Duration::from_millis(5);
    loop {
        if let Some(guard) = try_acquire(provider, key, ttl).await? {
            return Ok(guard);
        }
        let waited = started.elapsed();
        if waited >= wait {
            let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
            return Err(Error::lock_timeout(key, waited_ms));
        }
        debug!(key, "lock busy, waiting");
        tokio::time::sleep(backoff.min(wait - waited)).await;
        backoff = (backoff * 2).min(Duration::from_millis(200));
    }
}
