//! # Database Models
//!
//! Data structures that map to the ledger tables.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `coupon_policies` | Promotion definitions with a fixed issuance quota |
//! | `coupons` | Individual coupons issued against a policy |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌──────────────────┐       ┌──────────────────────┐
//! │ coupon_policies  │──────<│       coupons        │
//! │                  │       │                      │
//! │ id (PK)          │       │ coupon_policy_id (FK)│
//! │ code (UNIQUE)    │       │ code (UNIQUE)        │
//! │ total_quantity   │       │ user_id              │
//! │ start/end_time   │       │ status               │
//! └──────────────────┘       └──────────────────────┘
//! ```
//!
//! ## Coupon State Machine
//!
//! ```text
//!   issue ──► AVAILABLE ──use──► USED
//!                 │                │
//!              cancel           cancel
//!                 ▼                ▼
//!             CANCELLED ◄──────────┘
//! ```
//!
//! `CANCELLED` is terminal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CouponError;
use crate::utils::generate_coupon_code;

/// How a policy's discount is computed. Opaque to issuance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    /// Flat amount off the order.
    FixedAmount,
    /// Percentage of the order, bounded by `maximum_discount_amount`.
    Percentage,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::FixedAmount => "FIXED_AMOUNT",
            DiscountType::Percentage => "PERCENTAGE",
        }
    }
}

impl FromStr for DiscountType {
    type Err = CouponError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIXED_AMOUNT" => Ok(DiscountType::FixedAmount),
            "PERCENTAGE" => Ok(DiscountType::Percentage),
            other => Err(CouponError::Internal(format!("unknown discount type '{}'", other))),
        }
    }
}

/// A promotion with a fixed quota of coupons.
///
/// Read-only from the issuance core's perspective. Policies are created
/// by an administrative flow outside this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CouponPolicy {
    pub id: Uuid,

    /// Human-facing unique code, e.g. `SUMMER10`.
    pub code: String,

    pub name: String,
    pub description: String,

    /// Upper bound on live coupons for this policy.
    pub total_quantity: i32,

    /// Inclusive start of the issuance window.
    pub start_time: DateTime<Utc>,

    /// Exclusive end of the issuance window. Also the coupon expiry.
    pub end_time: DateTime<Utc>,

    pub discount_type: DiscountType,
    pub discount_value: i32,
    pub minimum_order_amount: i32,
    pub maximum_discount_amount: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CouponPolicy {
    /// Whether `now` falls in the half-open window `[start_time, end_time)`.
    pub fn is_within_issuance_window(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    /// Slots left given the number of live coupons. Never negative.
    pub fn remaining_after(&self, issued: i64) -> i64 {
        (i64::from(self.total_quantity) - issued).max(0)
    }
}

/// Coupon lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    Available,
    Used,
    Cancelled,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Available => "AVAILABLE",
            CouponStatus::Used => "USED",
            CouponStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CouponStatus {
    type Err = CouponError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(CouponStatus::Available),
            "USED" => Ok(CouponStatus::Used),
            "CANCELLED" => Ok(CouponStatus::Cancelled),
            other => Err(CouponError::Internal(format!("unknown coupon status '{}'", other))),
        }
    }
}

/// A single coupon issued to a user.
///
/// ## Invariants
///
/// - `status == Used` implies `used_at` and `order_id` are set
/// - `status == Available` implies both are empty
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coupon {
    pub id: Uuid,

    /// Globally unique redemption code.
    pub code: String,

    pub status: CouponStatus,
    pub used_at: Option<DateTime<Utc>>,
    pub user_id: String,
    pub order_id: Option<String>,
    pub coupon_policy_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    /// A fresh `AVAILABLE` coupon for `user_id` under `policy_id`.
    pub fn issue(policy_id: Uuid, user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: generate_coupon_code(),
            status: CouponStatus::Available,
            used_at: None,
            user_id: user_id.to_string(),
            order_id: None,
            coupon_policy_id: policy_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// `AVAILABLE -> USED`.
    ///
    /// The status check runs before the expiry check, so redeeming an
    /// already used coupon after expiry still reports `InvalidState`.
    pub fn mark_used(
        &mut self,
        order_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CouponError> {
        if self.status != CouponStatus::Available {
            return Err(CouponError::InvalidState(format!(
                "coupon {} is {} and cannot be used",
                self.code, self.status
            )));
        }
        if now >= expires_at {
            return Err(CouponError::InvalidPeriod(format!("coupon {} has expired", self.code)));
        }

        self.status = CouponStatus::Used;
        self.order_id = Some(order_id.to_string());
        self.used_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `AVAILABLE | USED -> CANCELLED`. Returns the status it left.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<CouponStatus, CouponError> {
        let previous = self.status;
        if previous == CouponStatus::Cancelled {
            return Err(CouponError::InvalidState(format!(
                "coupon {} is already cancelled",
                self.code
            )));
        }

        self.status = CouponStatus::Cancelled;
        self.order_id = None;
        self.used_at = None;
        self.updated_at = now;
        Ok(previous)
    }
}
