//! # Coupon Error Taxonomy
//!
//! Every rejection the issuance core can produce. Each variant carries a
//! stable machine-readable code so callers can tell transient contention
//! (`TooManyRequests`, `Internal`) apart from permanent outcomes
//! (`QuotaExceeded`, `InvalidPeriod`, `NotFound`, `Unauthorized`).
//!
//! | Variant | Code | Retry? |
//! |---------|------|--------|
//! | `NotFound` | `NOT_FOUND` | no |
//! | `InvalidPeriod` | `INVALID_PERIOD` | no |
//! | `QuotaExceeded` | `QUOTA_EXCEEDED` | no |
//! | `TooManyRequests` | `TOO_MANY_REQUESTS` | yes, with backoff |
//! | `Unauthorized` | `UNAUTHORIZED` | no |
//! | `Conflict` | `CONFLICT` | no |
//! | `InvalidState` | `INVALID_STATE` | no |
//! | `Internal` | `INTERNAL` | at the client's discretion |

use thiserror::Error;

/// Errors surfaced by the ledger, cache, lock, queue and service layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CouponError {
    /// Policy or coupon does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request arrived outside the policy's `[start_time, end_time)` window.
    #[error("Outside issuance period: {0}")]
    InvalidPeriod(String),

    /// The policy has no quota left.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The policy lock could not be acquired within the bounded wait.
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// Caller does not own the coupon.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Uniqueness violation, e.g. a second coupon for the same (policy, user).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Lifecycle transition not allowed from the coupon's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage, cache or broker failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CouponError {
    /// Stable error code returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CouponError::NotFound(_) => "NOT_FOUND",
            CouponError::InvalidPeriod(_) => "INVALID_PERIOD",
            CouponError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            CouponError::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            CouponError::Unauthorized(_) => "UNAUTHORIZED",
            CouponError::Conflict(_) => "CONFLICT",
            CouponError::InvalidState(_) => "INVALID_STATE",
            CouponError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a client may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CouponError::TooManyRequests(_) | CouponError::Internal(_))
    }
}

impl From<redis::RedisError> for CouponError {
    fn from(e: redis::RedisError) -> Self {
        CouponError::Internal(format!("cache: {}", e))
    }
}
