//! # Cache Module
//!
//! Advisory key-value state kept next to the ledger:
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `coupon:policy:quantity:{policy_code}` | remaining quota (integer) | until policy `end_time` |
//! | `coupon:state:{coupon_code}` | coupon JSON | until policy `end_time` |
//!
//! The quota counter is a hint. It may drift from the ledger when a
//! compensation fails, and the reconciler pulls it back. Only the ledger
//! decides whether a coupon exists.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::db::Coupon;
use crate::error::CouponError;

pub use self::memory::InMemoryCache;
pub use self::redis::RedisCache;

pub const QUOTA_KEY_PREFIX: &str = "coupon:policy:quantity:";
pub const COUPON_STATE_KEY_PREFIX: &str = "coupon:state:";

pub fn quota_key(policy_code: &str) -> String {
    format!("{}{}", QUOTA_KEY_PREFIX, policy_code)
}

pub fn coupon_state_key(coupon_code: &str) -> String {
    format!("{}{}", COUPON_STATE_KEY_PREFIX, coupon_code)
}

/// Remaining-quota counter keyed by policy code.
///
/// Decrement and increment are atomic and only apply to an existing key.
/// `None` means the counter is absent (a Miss), never zero.
#[async_trait]
pub trait QuotaCounter: Send + Sync {
    async fn get(&self, policy_code: &str) -> Result<Option<i64>, CouponError>;

    /// Overwrite the counter.
    async fn set(&self, policy_code: &str, value: i64, ttl: Duration) -> Result<(), CouponError>;

    /// Set the counter only if it is absent. Returns whether it was written.
    async fn seed(&self, policy_code: &str, value: i64, ttl: Duration) -> Result<bool, CouponError>;

    async fn decrement_and_get(&self, policy_code: &str) -> Result<Option<i64>, CouponError>;

    /// No-op on a missing key.
    async fn increment_and_get(&self, policy_code: &str) -> Result<Option<i64>, CouponError>;

    /// Liveness probe for `/health`.
    async fn ping(&self) -> bool;
}

/// Read-through cache of coupon state keyed by coupon code.
#[async_trait]
pub trait CouponStateCache: Send + Sync {
    async fn put_coupon(&self, coupon: &Coupon, ttl: Duration) -> Result<(), CouponError>;

    async fn get_coupon(&self, coupon_code: &str) -> Result<Option<Coupon>, CouponError>;

    async fn remove_coupon(&self, coupon_code: &str) -> Result<(), CouponError>;
}

pub(crate) fn encode_coupon(coupon: &Coupon) -> Result<String, CouponError> {
    serde_json::to_string(coupon)
        .map_err(|e| CouponError::Internal(format!("failed to encode coupon {}: {}", coupon.code, e)))
}

pub(crate) fn decode_coupon(raw: &str) -> Result<Coupon, CouponError> {
    serde_json::from_str(raw).map_err(|e| CouponError::Internal(format!("corrupt coupon cache entry: {}", e)))
}
