//! In-process lease table.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{Result, lock::LockProvider};

struct Lease {
    token: String,
    expires_at: Instant,
}

/// Leases kept in a `HashMap`. Only valid for a single process.
pub struct InMemoryLocks {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockProvider for InMemoryLocks {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(lease) = leases.get(key)
            && lease.expires_at > now
            && lease.token != token
        {
            return Ok(false);
        }
        leases.insert(key.to_string(), Lease {
            token: token.to_string(),
            expires_at: now + ttl,
        });
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(key).is_some_and(|l| l.token == token) {
            leases.remove(key);
        }
        Ok(())
    }
}
