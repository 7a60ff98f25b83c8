//! # API Request Models
//!
//! Structures for incoming API request bodies.
//! Each struct represents the expected JSON body for an endpoint.
//!
//! The caller's user id never travels in a body; it comes from the
//! `X-USER-ID` header set by the gateway.

use serde::{Deserialize, Serialize};

/// Maximum accepted length of a coupon, policy or order code.
pub const MAX_CODE_LEN: usize = 64;

/// Request to issue a coupon, synchronously or through the queue.
///
/// ## Example JSON
///
/// ```json
/// {
///     "policyCode": "SUMMER10"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCouponRequest {
    #[serde(alias = "policy_code")]
    pub policy_code: String,
}

impl IssueCouponRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_code("policyCode", &self.policy_code)
    }
}

/// Request to redeem a coupon against an order.
///
/// ## Example JSON
///
/// ```json
/// {
///     "couponCode": "3F2A9C0E...",
///     "orderId": "ORDER-1001"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseCouponRequest {
    #[serde(alias = "coupon_code")]
    pub coupon_code: String,

    #[serde(alias = "order_id")]
    pub order_id: String,
}

impl UseCouponRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_code("couponCode", &self.coupon_code)?;
        validate_code("orderId", &self.order_id)
    }
}

/// Request to cancel a coupon. Also the refund path for used coupons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelCouponRequest {
    #[serde(alias = "coupon_code")]
    pub coupon_code: String,
}

impl CancelCouponRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_code("couponCode", &self.coupon_code)
    }
}

fn validate_code(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is required", field));
    }
    if value.len() > MAX_CODE_LEN {
        return Err(format!("{} exceeds {} characters", field, MAX_CODE_LEN));
    }
    Ok(())
}
