//! In-process lock with expiring, token-owned leases.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::DistributedLock;
use crate::error::CouponError;

struct Lease {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, CouponError> {
        self.leases
            .lock()
            .map_err(|_| CouponError::Internal("lock table poisoned".to_string()))
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CouponError> {
        let now = Instant::now();
        let mut leases = self.leases()?;
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, CouponError> {
        let mut leases = self.leases()?;
        match leases.get(key) {
            Some(lease) if lease.token == token && lease.expires_at > Instant::now() => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
