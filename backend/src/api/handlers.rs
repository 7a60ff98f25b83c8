//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts the caller from the `X-USER-ID` header
//! 2. Validates input
//! 3. Calls the appropriate service
//! 4. Returns a formatted response
//!
//! ## Error Handling
//!
//! Service errors become JSON with a stable code and a retry hint:
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "TOO_MANY_REQUESTS",
//!         "message": "Too many requests: policy SUMMER10 is busy, retry later",
//!         "retryable": true
//!     }
//! }
//! ```

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::CouponError;
use crate::models::{
    ApiResponse, CancelCouponRequest, CouponDetailResponse, CouponListResponse, CouponPolicyResponse,
    CouponResponse, HealthResponse, IssueCouponRequest, UseCouponRequest,
};
use crate::utils::validate_user_id;
use crate::AppState;

/// Header carrying the authenticated caller, set by the gateway.
pub const USER_ID_HEADER: &str = "X-USER-ID";

/// HTTP status for each domain error.
pub fn status_for(err: &CouponError) -> StatusCode {
    match err {
        CouponError::NotFound(_) => StatusCode::NOT_FOUND,
        CouponError::InvalidPeriod(_) => StatusCode::BAD_REQUEST,
        CouponError::QuotaExceeded(_) => StatusCode::GONE,
        CouponError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        CouponError::Unauthorized(_) => StatusCode::FORBIDDEN,
        CouponError::Conflict(_) => StatusCode::CONFLICT,
        CouponError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CouponError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(context: &str, err: &CouponError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        error!("{} failed: {}", context, err);
    } else {
        warn!("{} rejected: {}", context, err);
    }
    HttpResponse::build(status).json(ApiResponse::<()>::from_error(err))
}

fn bad_request(code: &str, message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ApiResponse::<()>::error(code, message))
}

/// The caller's user id, or the response to send back.
fn caller_id(req: &HttpRequest) -> Result<String, HttpResponse> {
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            HttpResponse::Unauthorized().json(ApiResponse::<()>::error(
                "MISSING_USER_ID",
                &format!("{} header is required", USER_ID_HEADER),
            ))
        })?;

    validate_user_id(user_id).map_err(|e| bad_request("INVALID_USER_ID", &e))?;
    Ok(user_id.to_string())
}

/// API information endpoint (root).
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Coupon Issuance API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Quota-constrained coupon issuance",
        "endpoints": {
            "health": { "method": "GET", "path": "/health" },
            "coupons": {
                "issue": { "method": "POST", "path": "/coupons/issue" },
                "issueAsync": { "method": "POST", "path": "/coupons/issue/async" },
                "use": { "method": "POST", "path": "/coupons/use" },
                "cancel": { "method": "POST", "path": "/coupons/cancel" },
                "get": { "method": "GET", "path": "/coupons/{coupon_code}" },
                "list": { "method": "GET", "path": "/coupons" }
            },
            "policies": {
                "get": { "method": "GET", "path": "/coupon-policies/{code}" },
                "coupons": { "method": "GET", "path": "/coupon-policies/{code}/coupons" }
            }
        }
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// `GET /health`
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "status": "healthy",
///         "database": true,
///         "cache": true,
///         "admissionStrategy": "transactional",
///         "version": "0.1.0",
///         "timestamp": "2026-07-01T12:00:00Z"
///     }
/// }
/// ```
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let database = state.backends.ledger.ping().await;
    let cache = state.backends.counter.ping().await;
    let healthy = database && cache;

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database,
        cache,
        admission_strategy: state.issuance.settings().strategy.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

/// Issue a coupon synchronously.
///
/// `POST /coupons/issue`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/coupons/issue \
///   -H "Content-Type: application/json" \
///   -H "X-USER-ID: user-42" \
///   -d '{"policyCode": "SUMMER10"}'
/// ```
pub async fn issue_coupon(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    body: web::Json<IssueCouponRequest>,
) -> HttpResponse {
    let user_id = match caller_id(&req) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    if let Err(e) = body.validate() {
        return bad_request("INVALID_REQUEST", &e);
    }

    info!("Issue request: {} for {}", body.policy_code, user_id);

    match state.issuance.issue_coupon(&body.policy_code, &user_id).await {
        Ok(coupon) => HttpResponse::Ok().json(ApiResponse::success(CouponResponse::from(coupon))),
        Err(e) => error_response("Issue", &e),
    }
}

/// Reserve quota and queue the issue.
///
/// `POST /coupons/issue/async`
///
/// Returns `202 Accepted` once the request is reserved and queued. The
/// coupon itself appears shortly afterwards under `GET /coupons`.
pub async fn request_issue(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    body: web::Json<IssueCouponRequest>,
) -> HttpResponse {
    let user_id = match caller_id(&req) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    if let Err(e) = body.validate() {
        return bad_request("INVALID_REQUEST", &e);
    }

    info!("Queued issue request: {} for {}", body.policy_code, user_id);

    match state.issuance.request_issue(&body.policy_code, &user_id).await {
        Ok(accepted) => HttpResponse::Accepted().json(ApiResponse::success(accepted)),
        Err(e) => error_response("Queued issue", &e),
    }
}

/// Redeem a coupon against an order.
///
/// `POST /coupons/use`
pub async fn use_coupon(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    body: web::Json<UseCouponRequest>,
) -> HttpResponse {
    let user_id = match caller_id(&req) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    if let Err(e) = body.validate() {
        return bad_request("INVALID_REQUEST", &e);
    }

    match state
        .lifecycle
        .use_coupon(&body.coupon_code, &user_id, &body.order_id)
        .await
    {
        Ok(coupon) => HttpResponse::Ok().json(ApiResponse::success(CouponResponse::from(coupon))),
        Err(e) => error_response("Use", &e),
    }
}

/// Cancel a coupon, returning its slot to the policy.
///
/// `POST /coupons/cancel`
pub async fn cancel_coupon(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    body: web::Json<CancelCouponRequest>,
) -> HttpResponse {
    let user_id = match caller_id(&req) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    if let Err(e) = body.validate() {
        return bad_request("INVALID_REQUEST", &e);
    }

    match state.lifecycle.cancel_coupon(&body.coupon_code, &user_id).await {
        Ok(coupon) => HttpResponse::Ok().json(ApiResponse::success(CouponResponse::from(coupon))),
        Err(e) => error_response("Cancel", &e),
    }
}

/// `GET /coupons/{coupon_code}`
pub async fn get_coupon(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    let user_id = match caller_id(&req) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let coupon_code = path.into_inner();

    match state.lifecycle.find_coupon_by_code(&coupon_code, &user_id).await {
        Ok((coupon, policy)) => HttpResponse::Ok().json(ApiResponse::success(CouponDetailResponse {
            coupon: coupon.into(),
            policy: policy.into(),
        })),
        Err(e) => error_response("Coupon lookup", &e),
    }
}

/// The caller's coupons.
///
/// `GET /coupons`
pub async fn list_my_coupons(req: HttpRequest, state: web::Data<Arc<AppState>>) -> HttpResponse {
    let user_id = match caller_id(&req) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match state.lifecycle.find_coupons_by_user(&user_id).await {
        Ok(coupons) => HttpResponse::Ok().json(ApiResponse::success(CouponListResponse::from(coupons))),
        Err(e) => error_response("Coupon listing", &e),
    }
}

/// `GET /coupon-policies/{code}`
pub async fn get_policy(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> HttpResponse {
    let code = path.into_inner();

    match state.lifecycle.find_policy_by_code(&code).await {
        Ok(policy) => HttpResponse::Ok().json(ApiResponse::success(CouponPolicyResponse::from(policy))),
        Err(e) => error_response("Policy lookup", &e),
    }
}

/// `GET /coupon-policies/{code}/coupons`
pub async fn list_policy_coupons(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> HttpResponse {
    let code = path.into_inner();

    match state.lifecycle.find_coupons_by_policy_code(&code).await {
        Ok(coupons) => HttpResponse::Ok().json(ApiResponse::success(CouponListResponse::from(coupons))),
        Err(e) => error_response("Policy coupon listing", &e),
    }
}
