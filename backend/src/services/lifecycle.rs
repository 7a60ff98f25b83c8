//! # Coupon Lifecycle
//!
//! Use and cancel transitions on issued coupons, plus the read side.
//!
//! Ownership is checked before any status check, so a caller who does not
//! own a coupon learns nothing about its state.
//!
//! Transitions are written with a compare-and-set on the previous status.
//! Two concurrent cancels of the same coupon therefore succeed once.

use tracing::{debug, info, warn};

use super::Backends;
use crate::db::{Coupon, CouponPolicy, CouponStatus};
use crate::error::CouponError;
use crate::utils::ttl_until;

#[derive(Clone)]
pub struct CouponLifecycle {
    backends: Backends,
}

impl CouponLifecycle {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    /// `AVAILABLE -> USED` for `order_id`.
    pub async fn use_coupon(&self, coupon_code: &str, user_id: &str, order_id: &str) -> Result<Coupon, CouponError> {
        info!("Using coupon {} for order {}", coupon_code, order_id);

        let mut coupon = self.owned_coupon(coupon_code, user_id).await?;
        let policy = self.backends.ledger.find_policy_by_id(coupon.coupon_policy_id).await?;

        let previous = coupon.status;
        coupon.mark_used(order_id, policy.end_time, self.backends.clock.now())?;
        let stored = self.store_transition(&coupon, previous).await?;

        self.cache_state(&stored, &policy).await;
        info!(coupon_code = %stored.code, user_id = %user_id, order_id = %order_id, "Coupon used");
        Ok(stored)
    }

    /// `AVAILABLE | USED -> CANCELLED`, releasing the quota slot.
    pub async fn cancel_coupon(&self, coupon_code: &str, user_id: &str) -> Result<Coupon, CouponError> {
        info!("Cancelling coupon {}", coupon_code);

        let mut coupon = self.owned_coupon(coupon_code, user_id).await?;
        let policy = self.backends.ledger.find_policy_by_id(coupon.coupon_policy_id).await?;

        let previous = coupon.cancel(self.backends.clock.now())?;
        let stored = self.store_transition(&coupon, previous).await?;

        // The ledger no longer counts this coupon. A missing counter is left
        // alone and will be seeded from the ledger on next use.
        match self.backends.counter.increment_and_get(&policy.code).await {
            Ok(Some(remaining)) => debug!("Returned slot to {} ({} left)", policy.code, remaining),
            Ok(None) => {}
            Err(e) => warn!("Failed to return slot to quota counter for {}: {}", policy.code, e),
        }

        self.cache_state(&stored, &policy).await;
        info!(
            coupon_code = %stored.code,
            user_id = %user_id,
            previous_status = %previous,
            "Coupon cancelled"
        );
        Ok(stored)
    }

    /// A coupon with its policy, for its owner only.
    ///
    /// Reads through the coupon state cache.
    pub async fn find_coupon_by_code(
        &self,
        coupon_code: &str,
        user_id: &str,
    ) -> Result<(Coupon, CouponPolicy), CouponError> {
        let cached = match self.backends.state_cache.get_coupon(coupon_code).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Coupon state cache read failed for {}: {}", coupon_code, e);
                None
            }
        };

        let (coupon, from_cache) = match cached {
            Some(coupon) => (coupon, true),
            None => (self.backends.ledger.find_coupon_by_code(coupon_code).await?, false),
        };
        ensure_owner(&coupon, user_id)?;

        let policy = self.backends.ledger.find_policy_by_id(coupon.coupon_policy_id).await?;
        if !from_cache {
            self.cache_state(&coupon, &policy).await;
        }
        Ok((coupon, policy))
    }

    pub async fn find_coupons_by_user(&self, user_id: &str) -> Result<Vec<Coupon>, CouponError> {
        self.backends.ledger.find_coupons_by_user(user_id).await
    }

    pub async fn find_coupons_by_policy_code(&self, policy_code: &str) -> Result<Vec<Coupon>, CouponError> {
        let policy = self.backends.ledger.find_policy_by_code(policy_code).await?;
        self.backends.ledger.find_coupons_by_policy(policy.id).await
    }

    pub async fn find_policy_by_code(&self, policy_code: &str) -> Result<CouponPolicy, CouponError> {
        self.backends.ledger.find_policy_by_code(policy_code).await
    }

    /// Authoritative read plus ownership check.
    async fn owned_coupon(&self, coupon_code: &str, user_id: &str) -> Result<Coupon, CouponError> {
        let coupon = self.backends.ledger.find_coupon_by_code(coupon_code).await?;
        ensure_owner(&coupon, user_id)?;
        Ok(coupon)
    }

    /// Compare-and-set on the ledger. A lost race also drops the cached
    /// state, which may be the stale copy that let the caller get this far.
    async fn store_transition(&self, coupon: &Coupon, expected: CouponStatus) -> Result<Coupon, CouponError> {
        match self.backends.ledger.update_coupon(coupon, expected).await {
            Ok(stored) => Ok(stored),
            Err(e @ CouponError::InvalidState(_)) => {
                if let Err(evict) = self.backends.state_cache.remove_coupon(&coupon.code).await {
                    warn!("Failed to evict cached state of coupon {}: {}", coupon.code, evict);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn cache_state(&self, coupon: &Coupon, policy: &CouponPolicy) {
        let ttl = ttl_until(policy.end_time, self.backends.clock.now());
        if let Err(e) = self.backends.state_cache.put_coupon(coupon, ttl).await {
            warn!("Failed to cache state of coupon {}: {}", coupon.code, e);
        }
    }
}

fn ensure_owner(coupon: &Coupon, user_id: &str) -> Result<(), CouponError> {
    if coupon.is_owned_by(user_id) {
        Ok(())
    } else {
        Err(CouponError::Unauthorized(format!(
            "coupon {} does not belong to user {}",
            coupon.code, user_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use crate::ledger::memory::fixtures::open_policy;
    use crate::ledger::{CouponLedger, InMemoryLedger};
    use crate::queue::ChannelQueue;
    use crate::utils::test_clock::ManualClock;
    use crate::utils::Clock;

    struct Fixture {
        lifecycle: CouponLifecycle,
        backends: Backends,
        ledger: Arc<InMemoryLedger>,
        policy: CouponPolicy,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let now = Utc::now();
        let ledger = Arc::new(InMemoryLedger::new(true));
        let policy = open_policy("SUMMER10", 3, now);
        ledger.add_policy(policy.clone()).await;

        let clock = Arc::new(ManualClock::new(now));
        let (queue, _) = ChannelQueue::new(1, 1);
        let backends = Backends::in_memory(ledger.clone(), Arc::new(queue)).with_clock(clock.clone());

        Fixture {
            lifecycle: CouponLifecycle::new(backends.clone()),
            backends,
            ledger,
            policy,
            clock,
        }
    }

    async fn issued(f: &Fixture, user_id: &str) -> Coupon {
        f.ledger
            .insert_coupon(&Coupon::issue(f.policy.id, user_id, f.clock.now()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_use_sets_order_and_timestamp() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;

        let used = f.lifecycle.use_coupon(&coupon.code, "u1", "order-1").await.unwrap();
        assert_eq!(used.status, CouponStatus::Used);
        assert_eq!(used.order_id.as_deref(), Some("order-1"));
        assert_eq!(used.used_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_use_twice_is_invalid_state() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;
        f.lifecycle.use_coupon(&coupon.code, "u1", "order-1").await.unwrap();

        let err = f.lifecycle.use_coupon(&coupon.code, "u1", "order-2").await.unwrap_err();
        assert!(matches!(err, CouponError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_twice_succeeds_once() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;

        f.lifecycle.cancel_coupon(&coupon.code, "u1").await.unwrap();
        let err = f.lifecycle.cancel_coupon(&coupon.code, "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_use_after_cancel_is_invalid_state() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;
        f.lifecycle.cancel_coupon(&coupon.code, "u1").await.unwrap();

        let err = f.lifecycle.use_coupon(&coupon.code, "u1", "order-1").await.unwrap_err();
        assert!(matches!(err, CouponError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_used_coupon_clears_order_and_frees_slot() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;
        f.backends.counter.set("SUMMER10", 2, Duration::from_secs(3600)).await.unwrap();
        f.lifecycle.use_coupon(&coupon.code, "u1", "order-1").await.unwrap();

        let cancelled = f.lifecycle.cancel_coupon(&coupon.code, "u1").await.unwrap();
        assert_eq!(cancelled.status, CouponStatus::Cancelled);
        assert!(cancelled.order_id.is_none());
        assert!(cancelled.used_at.is_none());
        assert_eq!(f.backends.counter.get("SUMMER10").await.unwrap(), Some(3));
        assert_eq!(f.ledger.count_issued(f.policy.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_without_counter_leaves_it_absent() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;

        f.lifecycle.cancel_coupon(&coupon.code, "u1").await.unwrap();
        assert_eq!(f.backends.counter.get("SUMMER10").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_use_after_policy_end_is_invalid_period() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;
        f.clock.set(f.policy.end_time);

        let err = f.lifecycle.use_coupon(&coupon.code, "u1", "order-1").await.unwrap_err();
        assert!(matches!(err, CouponError::InvalidPeriod(_)));
    }

    #[tokio::test]
    async fn test_other_user_is_unauthorized_regardless_of_status() {
        let f = fixture().await;
        let available = issued(&f, "owner").await;
        let cancelled = issued(&f, "owner-2").await;
        f.lifecycle.cancel_coupon(&cancelled.code, "owner-2").await.unwrap();

        for code in [&available.code, &cancelled.code] {
            let use_err = f.lifecycle.use_coupon(code, "intruder", "order-1").await.unwrap_err();
            let cancel_err = f.lifecycle.cancel_coupon(code, "intruder").await.unwrap_err();
            let find_err = f.lifecycle.find_coupon_by_code(code, "intruder").await.unwrap_err();
            assert!(matches!(use_err, CouponError::Unauthorized(_)));
            assert!(matches!(cancel_err, CouponError::Unauthorized(_)));
            assert!(matches!(find_err, CouponError::Unauthorized(_)));
        }
    }

    #[tokio::test]
    async fn test_find_by_code_returns_policy_and_fills_cache() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;
        assert_eq!(f.backends.state_cache.get_coupon(&coupon.code).await.unwrap(), None);

        let (found, policy) = f.lifecycle.find_coupon_by_code(&coupon.code, "u1").await.unwrap();
        assert_eq!(found, coupon);
        assert_eq!(policy.code, "SUMMER10");
        assert_eq!(f.backends.state_cache.get_coupon(&coupon.code).await.unwrap(), Some(coupon));
    }

    #[tokio::test]
    async fn test_lost_transition_evicts_cached_state() {
        let f = fixture().await;
        let coupon = issued(&f, "u1").await;
        f.lifecycle.find_coupon_by_code(&coupon.code, "u1").await.unwrap();

        let mut cancelled = coupon.clone();
        cancelled.cancel(f.clock.now()).unwrap();
        f.ledger.update_coupon(&cancelled, CouponStatus::Available).await.unwrap();

        let mut used = coupon.clone();
        used.mark_used("order-1", f.policy.end_time, f.clock.now()).unwrap();
        let err = f
            .lifecycle
            .store_transition(&used, CouponStatus::Available)
            .await
            .unwrap_err();
        assert!(matches!(err, CouponError::InvalidState(_)));
        assert_eq!(f.backends.state_cache.get_coupon(&coupon.code).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_missing_coupon_is_not_found() {
        let f = fixture().await;
        let err = f.lifecycle.find_coupon_by_code("NOPE", "u1").await.unwrap_err();
        assert!(matches!(err, CouponError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_listing_by_user_and_policy() {
        let f = fixture().await;
        issued(&f, "u1").await;
        issued(&f, "u2").await;

        assert_eq!(f.lifecycle.find_coupons_by_user("u1").await.unwrap().len(), 1);
        assert_eq!(f.lifecycle.find_coupons_by_policy_code("SUMMER10").await.unwrap().len(), 2);
        assert!(matches!(
            f.lifecycle.find_coupons_by_policy_code("NOPE").await,
            Err(CouponError::NotFound(_))
        ));
    }
}
