//! In-process cache with the same semantics as the Redis backend.
//!
//! Expiry follows `tokio::time::Instant`, so TTLs respect a paused test clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{coupon_state_key, decode_coupon, encode_coupon, quota_key, CouponStateCache, QuotaCounter};
use crate::db::Coupon;
use crate::error::CouponError;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct CacheState {
    counters: HashMap<String, Entry<i64>>,
    documents: HashMap<String, Entry<String>>,
}

#[derive(Default)]
pub struct InMemoryCache {
    state: Mutex<CacheState>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState, Instant) -> R) -> Result<R, CouponError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CouponError::Internal("cache state poisoned".to_string()))?;
        let now = Instant::now();
        state.counters.retain(|_, e| e.live(now));
        state.documents.retain(|_, e| e.live(now));
        Ok(f(&mut state, now))
    }

    fn adjust(&self, policy_code: &str, delta: i64) -> Result<Option<i64>, CouponError> {
        let key = quota_key(policy_code);
        self.with_state(|state, _| {
            state.counters.get_mut(&key).map(|entry| {
                entry.value += delta;
                entry.value
            })
        })
    }
}

#[async_trait]
impl QuotaCounter for InMemoryCache {
    async fn get(&self, policy_code: &str) -> Result<Option<i64>, CouponError> {
        let key = quota_key(policy_code);
        self.with_state(|state, _| state.counters.get(&key).map(|e| e.value))
    }

    async fn set(&self, policy_code: &str, value: i64, ttl: Duration) -> Result<(), CouponError> {
        let key = quota_key(policy_code);
        self.with_state(|state, now| {
            state.counters.insert(key, Entry { value, expires_at: now + ttl });
        })
    }

    async fn seed(&self, policy_code: &str, value: i64, ttl: Duration) -> Result<bool, CouponError> {
        let key = quota_key(policy_code);
        self.with_state(|state, now| {
            if state.counters.contains_key(&key) {
                return false;
            }
            state.counters.insert(key, Entry { value, expires_at: now + ttl });
            true
        })
    }

    async fn decrement_and_get(&self, policy_code: &str) -> Result<Option<i64>, CouponError> {
        self.adjust(policy_code, -1)
    }

    async fn increment_and_get(&self, policy_code: &str) -> Result<Option<i64>, CouponError> {
        self.adjust(policy_code, 1)
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[async_trait]
impl CouponStateCache for InMemoryCache {
    async fn put_coupon(&self, coupon: &Coupon, ttl: Duration) -> Result<(), CouponError> {
        let payload = encode_coupon(coupon)?;
        let key = coupon_state_key(&coupon.code);
        self.with_state(|state, now| {
            state.documents.insert(key, Entry { value: payload, expires_at: now + ttl });
        })
    }

    async fn get_coupon(&self, coupon_code: &str) -> Result<Option<Coupon>, CouponError> {
        let key = coupon_state_key(coupon_code);
        let raw = self.with_state(|state, _| state.documents.get(&key).map(|e| e.value.clone()))?;
        raw.as_deref().map(decode_coupon).transpose()
    }

    async fn remove_coupon(&self, coupon_code: &str) -> Result<(), CouponError> {
        let key = coupon_state_key(coupon_code);
        self.with_state(|state, _| {
            state.documents.remove(&key);
        })
    }
}
