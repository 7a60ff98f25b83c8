//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                     GET  - Health check
/// ├── /coupons
/// │   ├── /issue                  POST - Issue synchronously
/// │   ├── /issue/async            POST - Reserve and queue
/// │   ├── /use                    POST - Redeem for an order
/// │   ├── /cancel                 POST - Cancel / refund
/// │   ├── /{coupon_code}          GET  - Coupon with its policy
/// │   └── (root)                  GET  - Caller's coupons
/// └── /coupon-policies
///     ├── /{code}                 GET  - Policy
///     └── /{code}/coupons         GET  - Coupons under a policy
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Root endpoint - API information
        .route("/", web::get().to(handlers::api_info))

        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        // Coupon endpoints
        .service(
            web::scope("/coupons")
                .route("", web::get().to(handlers::list_my_coupons))
                .route("/issue", web::post().to(handlers::issue_coupon))
                .route("/issue/async", web::post().to(handlers::request_issue))
                .route("/use", web::post().to(handlers::use_coupon))
                .route("/cancel", web::post().to(handlers::cancel_coupon))
                .route("/{coupon_code}", web::get().to(handlers::get_coupon)),
        )

        // Policy endpoints
        .service(
            web::scope("/coupon-policies")
                .route("/{code}", web::get().to(handlers::get_policy))
                .route("/{code}/coupons", web::get().to(handlers::list_policy_coupons)),
        );
}
