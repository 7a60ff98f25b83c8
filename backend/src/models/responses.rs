//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Coupon, CouponPolicy, CouponStatus, DiscountType};
use crate::error::CouponError;

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "QUOTA_EXCEEDED",
///         "message": "policy SUMMER10 has no coupons left",
///         "retryable": false
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create a non-retryable error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
                retryable: false,
            }),
        }
    }

    /// Error response carrying the domain error's code and retry hint.
    pub fn from_error(err: &CouponError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            }),
        }
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "QUOTA_EXCEEDED").
    pub code: String,

    /// Human-readable error message.
    pub message: String,

    /// Whether the same request may succeed later.
    pub retryable: bool,
}

/// A coupon as returned to its owner.
///
/// ## Example Response
///
/// ```json
/// {
///     "id": "5b0b6f2e-...",
///     "code": "3F2A9C0E5D714B6A8C1F0E2D3B4A5C6D",
///     "status": "USED",
///     "userId": "user-42",
///     "orderId": "ORDER-1001",
///     "usedAt": "2026-07-01T10:00:00Z",
///     "couponPolicyId": "9d7c...",
///     "createdAt": "2026-07-01T09:00:00Z",
///     "updatedAt": "2026-07-01T10:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponResponse {
    pub id: Uuid,
    pub code: String,
    pub status: CouponStatus,
    pub user_id: String,
    pub order_id: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub coupon_policy_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Coupon> for CouponResponse {
    fn from(coupon: Coupon) -> Self {
        Self {
            id: coupon.id,
            code: coupon.code,
            status: coupon.status,
            user_id: coupon.user_id,
            order_id: coupon.order_id,
            used_at: coupon.used_at,
            coupon_policy_id: coupon.coupon_policy_id,
            created_at: coupon.created_at,
            updated_at: coupon.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponPolicyResponse {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: String,
    pub total_quantity: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub discount_type: DiscountType,
    pub discount_value: i32,
    pub minimum_order_amount: i32,
    pub maximum_discount_amount: i32,
}

impl From<CouponPolicy> for CouponPolicyResponse {
    fn from(policy: CouponPolicy) -> Self {
        Self {
            id: policy.id,
            code: policy.code,
            name: policy.name,
            description: policy.description,
            total_quantity: policy.total_quantity,
            start_time: policy.start_time,
            end_time: policy.end_time,
            discount_type: policy.discount_type,
            discount_value: policy.discount_value,
            minimum_order_amount: policy.minimum_order_amount,
            maximum_discount_amount: policy.maximum_discount_amount,
        }
    }
}

/// Returned by `GET /coupons/{coupon_code}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponDetailResponse {
    pub coupon: CouponResponse,
    pub policy: CouponPolicyResponse,
}

/// List of coupons.
///
/// Returned by `GET /coupons` and `GET /coupon-policies/{code}/coupons`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponListResponse {
    pub coupons: Vec<CouponResponse>,
    pub total: usize,
}

impl From<Vec<Coupon>> for CouponListResponse {
    fn from(coupons: Vec<Coupon>) -> Self {
        let total = coupons.len();
        Self {
            coupons: coupons.into_iter().map(CouponResponse::from).collect(),
            total,
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status: "healthy" or "unhealthy".
    pub status: String,

    /// Database connection status.
    pub database: bool,

    /// Redis (counter, lock, state cache) status.
    pub cache: bool,

    /// Synchronous admission strategy in use.
    pub admission_strategy: String,

    /// Service version.
    pub version: String,

    /// Current timestamp.
    pub timestamp: DateTime<Utc>,
}
