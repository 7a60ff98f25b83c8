//! In-process ledger.
//!
//! Applies the same uniqueness rules as the PostgreSQL schema. An optional
//! per-operation latency stands in for a network round trip so that
//! interleavings between concurrent requests are reproducible under a
//! paused tokio clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{coupon_not_found, policy_not_found, stale_transition, AdmissionRule, CouponLedger, IssueSnapshot};
use crate::db::{Coupon, CouponPolicy, CouponStatus};
use crate::error::CouponError;

#[derive(Default)]
struct LedgerState {
    policies: HashMap<Uuid, CouponPolicy>,
    coupons: Vec<Coupon>,
}

impl LedgerState {
    fn policy_by_code(&self, code: &str) -> Option<&CouponPolicy> {
        self.policies.values().find(|p| p.code == code)
    }

    fn count_issued(&self, policy_id: Uuid) -> i64 {
        self.coupons
            .iter()
            .filter(|c| c.coupon_policy_id == policy_id && c.status != CouponStatus::Cancelled)
            .count() as i64
    }

    fn user_holds(&self, policy_id: Uuid, user_id: &str) -> bool {
        self.coupons
            .iter()
            .any(|c| c.coupon_policy_id == policy_id && c.user_id == user_id)
    }
}

pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    /// Serializes `issue_exclusive` the way a row lock would.
    exclusive: Mutex<()>,
    one_coupon_per_user: bool,
    latency: Duration,
    failing_inserts: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new(one_coupon_per_user: bool) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            exclusive: Mutex::new(()),
            one_coupon_per_user,
            latency: Duration::ZERO,
            failing_inserts: AtomicUsize::new(0),
        }
    }

    /// Sleep this long after every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn add_policy(&self, policy: CouponPolicy) {
        self.state.lock().await.policies.insert(policy.id, policy);
    }

    /// Make the next `count` inserts fail with `Internal`.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert_locked(&self, state: &mut LedgerState, coupon: &Coupon) -> Result<Coupon, CouponError> {
        if self.take_injected_failure() {
            return Err(CouponError::Internal("simulated storage failure".to_string()));
        }
        if state.coupons.iter().any(|c| c.code == coupon.code) {
            return Err(CouponError::Conflict(format!("coupon code {} exists", coupon.code)));
        }
        if self.one_coupon_per_user && state.user_holds(coupon.coupon_policy_id, &coupon.user_id) {
            return Err(CouponError::Conflict(format!(
                "user {} already holds a coupon for policy {}",
                coupon.user_id, coupon.coupon_policy_id
            )));
        }
        state.coupons.push(coupon.clone());
        Ok(coupon.clone())
    }
}

#[async_trait]
impl CouponLedger for InMemoryLedger {
    async fn find_policy_by_code(&self, code: &str) -> Result<CouponPolicy, CouponError> {
        let found = self.state.lock().await.policy_by_code(code).cloned();
        self.round_trip().await;
        found.ok_or_else(|| policy_not_found(code))
    }

    async fn find_policy_by_id(&self, id: Uuid) -> Result<CouponPolicy, CouponError> {
        let found = self.state.lock().await.policies.get(&id).cloned();
        self.round_trip().await;
        found.ok_or_else(|| policy_not_found(&id.to_string()))
    }

    async fn list_active_policies(&self, now: DateTime<Utc>) -> Result<Vec<CouponPolicy>, CouponError> {
        let mut active: Vec<CouponPolicy> = self
            .state
            .lock()
            .await
            .policies
            .values()
            .filter(|p| p.is_within_issuance_window(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.code.cmp(&b.code));
        self.round_trip().await;
        Ok(active)
    }

    async fn count_issued(&self, policy_id: Uuid) -> Result<i64, CouponError> {
        let issued = self.state.lock().await.count_issued(policy_id);
        self.round_trip().await;
        Ok(issued)
    }

    async fn user_holds_coupon(&self, policy_id: Uuid, user_id: &str) -> Result<bool, CouponError> {
        let held = self.state.lock().await.user_holds(policy_id, user_id);
        self.round_trip().await;
        Ok(held)
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> Result<Coupon, CouponError> {
        let result = {
            let mut state = self.state.lock().await;
            self.insert_locked(&mut state, coupon)
        };
        self.round_trip().await;
        result
    }

    async fn issue_exclusive(
        &self,
        policy_code: &str,
        user_id: &str,
        admit: &AdmissionRule<'_>,
    ) -> Result<Coupon, CouponError> {
        let _row_lock = self.exclusive.lock().await;

        let (policy, snapshot) = {
            let state = self.state.lock().await;
            let policy = state
                .policy_by_code(policy_code)
                .cloned()
                .ok_or_else(|| policy_not_found(policy_code))?;
            let snapshot = IssueSnapshot {
                issued: state.count_issued(policy.id),
                user_holds_coupon: state.user_holds(policy.id, user_id),
            };
            (policy, snapshot)
        };
        self.round_trip().await;

        let coupon = admit(&policy, &snapshot)?;
        let result = {
            let mut state = self.state.lock().await;
            self.insert_locked(&mut state, &coupon)
        };
        self.round_trip().await;
        result
    }

    async fn find_coupon_by_code(&self, code: &str) -> Result<Coupon, CouponError> {
        let found = self
            .state
            .lock()
            .await
            .coupons
            .iter()
            .find(|c| c.code == code)
            .cloned();
        self.round_trip().await;
        found.ok_or_else(|| coupon_not_found(code))
    }

    async fn update_coupon(&self, coupon: &Coupon, expected: CouponStatus) -> Result<Coupon, CouponError> {
        let result = {
            let mut state = self.state.lock().await;
            match state.coupons.iter_mut().find(|c| c.id == coupon.id) {
                None => Err(coupon_not_found(&coupon.code)),
                Some(stored) if stored.status != expected => Err(stale_transition(coupon, expected)),
                Some(stored) => {
                    stored.status = coupon.status;
                    stored.used_at = coupon.used_at;
                    stored.order_id = coupon.order_id.clone();
                    stored.updated_at = coupon.updated_at;
                    Ok(stored.clone())
                }
            }
        };
        self.round_trip().await;
        result
    }

    async fn find_coupons_by_user(&self, user_id: &str) -> Result<Vec<Coupon>, CouponError> {
        let mut coupons: Vec<Coupon> = self
            .state
            .lock()
            .await
            .coupons
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        coupons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.round_trip().await;
        Ok(coupons)
    }

    async fn find_coupons_by_policy(&self, policy_id: Uuid) -> Result<Vec<Coupon>, CouponError> {
        let mut coupons: Vec<Coupon> = self
            .state
            .lock()
            .await
            .coupons
            .iter()
            .filter(|c| c.coupon_policy_id == policy_id)
            .cloned()
            .collect();
        coupons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.round_trip().await;
        Ok(coupons)
    }

    async fn ping(&self) -> bool {
        true
    }
}
