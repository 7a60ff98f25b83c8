//! # Coupon Ledger
//!
//! Authoritative store of policies and coupons. Every admission decision
//! is ultimately checked against this layer:
//!
//! - `count_issued` never includes `CANCELLED` coupons
//! - coupon codes are unique
//! - with the one-coupon-per-user rule on, `(policy, user)` is unique
//!
//! [`CouponLedger::issue_exclusive`] is the serialization point for the
//! transactional strategy and the queue consumer: it reads the policy
//! under an exclusive lock, hands a snapshot to an admission rule, and
//! inserts whatever the rule returns before anyone else can read the
//! same policy exclusively.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{Coupon, CouponPolicy, CouponStatus};
use crate::error::CouponError;

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// What an admission rule sees while the policy is exclusively held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueSnapshot {
    /// Live (non-cancelled) coupons under the policy.
    pub issued: i64,
    /// Whether the requesting user already holds a coupon for the policy.
    pub user_holds_coupon: bool,
}

/// Decides, under the policy lock, whether to mint a coupon.
pub type AdmissionRule<'a> =
    dyn Fn(&CouponPolicy, &IssueSnapshot) -> Result<Coupon, CouponError> + Send + Sync + 'a;

#[async_trait]
pub trait CouponLedger: Send + Sync {
    /// `NotFound` when no policy has this code.
    async fn find_policy_by_code(&self, code: &str) -> Result<CouponPolicy, CouponError>;

    async fn find_policy_by_id(&self, id: Uuid) -> Result<CouponPolicy, CouponError>;

    /// Policies whose issuance window contains `now`.
    async fn list_active_policies(&self, now: DateTime<Utc>) -> Result<Vec<CouponPolicy>, CouponError>;

    /// Live coupons under the policy.
    async fn count_issued(&self, policy_id: Uuid) -> Result<i64, CouponError>;

    async fn user_holds_coupon(&self, policy_id: Uuid, user_id: &str) -> Result<bool, CouponError>;

    /// `Conflict` on a uniqueness violation.
    async fn insert_coupon(&self, coupon: &Coupon) -> Result<Coupon, CouponError>;

    /// Read the policy exclusively, run `admit`, insert its coupon, commit.
    ///
    /// A rejection from `admit` rolls back and is returned unchanged.
    async fn issue_exclusive(
        &self,
        policy_code: &str,
        user_id: &str,
        admit: &AdmissionRule<'_>,
    ) -> Result<Coupon, CouponError>;

    async fn find_coupon_by_code(&self, code: &str) -> Result<Coupon, CouponError>;

    /// Persist a lifecycle transition if the stored row is still `expected`.
    ///
    /// `InvalidState` when a concurrent transition got there first.
    async fn update_coupon(&self, coupon: &Coupon, expected: CouponStatus) -> Result<Coupon, CouponError>;

    async fn find_coupons_by_user(&self, user_id: &str) -> Result<Vec<Coupon>, CouponError>;

    async fn find_coupons_by_policy(&self, policy_id: Uuid) -> Result<Vec<Coupon>, CouponError>;

    /// Liveness probe for `/health`.
    async fn ping(&self) -> bool;
}

pub(crate) fn policy_not_found(code: &str) -> CouponError {
    CouponError::NotFound(format!("coupon policy '{}'", code))
}

pub(crate) fn coupon_not_found(code: &str) -> CouponError {
    CouponError::NotFound(format!("coupon '{}'", code))
}

pub(crate) fn stale_transition(coupon: &Coupon, expected: CouponStatus) -> CouponError {
    CouponError::InvalidState(format!(
        "coupon {} is no longer {}",
        coupon.code, expected
    ))
}
