//! # Distributed Lock
//!
//! Per-policy mutual exclusion across service instances, used around the
//! quota counter's reserve step.
//!
//! - A lock is a key `coupon:lock:{policy_code}` holding a random token.
//! - Acquisition is an atomic set-if-absent with a TTL, so a crashed
//!   holder can never wedge the policy for longer than the TTL.
//! - Release deletes the key only if it still holds the caller's token,
//!   so a holder whose TTL lapsed cannot free a successor's lock.
//!
//! ```text
//!   acquire_with_backoff
//!     │
//!     ├─ try_acquire ──► granted ──► LockGuard ──► release (compare-and-delete)
//!     │
//!     └─ held ──► sleep(25ms, 50ms, 100ms, 200ms, 200ms ...) ──► retry
//!                    │
//!                    └─ wait budget spent ──► TooManyRequests
//! ```

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CouponError;

pub use self::memory::InMemoryLock;
pub use self::redis::RedisLock;

pub const LOCK_KEY_PREFIX: &str = "coupon:lock:";

pub fn lock_key(policy_code: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, policy_code)
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Set `key` to `token` with `ttl` if absent. Returns whether it was granted.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CouponError>;

    /// Delete `key` only if it still holds `token`. Returns whether it was deleted.
    async fn release(&self, key: &str, token: &str) -> Result<bool, CouponError>;
}

/// Timing for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Lease length. Must exceed the longest reserve step.
    pub ttl: Duration,
    /// Total time to keep retrying before giving up.
    pub wait: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            wait: Duration::from_secs(3),
            retry_min: Duration::from_millis(25),
            retry_max: Duration::from_millis(200),
        }
    }
}

/// Proof of holding a policy lock. Release it explicitly.
#[derive(Debug)]
#[must_use = "a held lock must be released"]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. A failed release is logged and left to the TTL.
    pub async fn release(self, lock: &dyn DistributedLock) {
        match lock.release(&self.key, &self.token).await {
            Ok(true) => debug!("Released lock {}", self.key),
            Ok(false) => warn!("Lock {} expired before release", self.key),
            Err(e) => warn!("Failed to release lock {}: {}", self.key, e),
        }
    }
}

/// Acquire the policy lock, retrying with exponential backoff.
///
/// Returns `TooManyRequests` once `settings.wait` has elapsed.
pub async fn acquire_with_backoff(
    lock: &dyn DistributedLock,
    policy_code: &str,
    settings: &LockSettings,
) -> Result<LockGuard, CouponError> {
    let key = lock_key(policy_code);
    let token = Uuid::new_v4().to_string();
    let deadline = Instant::now() + settings.wait;
    let mut delay = settings.retry_min;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if lock.try_acquire(&key, &token, settings.ttl).await? {
            debug!("Acquired lock {} after {} attempt(s)", key, attempts);
            return Ok(LockGuard { key, token });
        }

        let now = Instant::now();
        if now >= deadline {
            warn!("Gave up on lock {} after {} attempts", key, attempts);
            return Err(CouponError::TooManyRequests(format!(
                "policy {} is busy, retry later",
                policy_code
            )));
        }

        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(settings.retry_max);
    }
}
