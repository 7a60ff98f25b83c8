//! # REST API Module
//!
//! This module defines all HTTP endpoints for the Coupon Issuance API.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/coupons/issue` | Issue a coupon now |
//! | POST | `/coupons/issue/async` | Reserve quota and queue the issue |
//! | POST | `/coupons/use` | Redeem a coupon for an order |
//! | POST | `/coupons/cancel` | Cancel a coupon |
//! | GET | `/coupons/{coupon_code}` | Coupon with its policy |
//! | GET | `/coupons` | Caller's coupons |
//! | GET | `/coupon-policies/{code}` | Policy |
//! | GET | `/coupon-policies/{code}/coupons` | Coupons under a policy |
//! | GET | `/health` | Health check |
//!
//! The caller is identified by the `X-USER-ID` header.
//!
//! ## Request/Response Format
//!
//! All requests and responses use JSON:
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "ERROR_CODE",
//!         "message": "Human readable message",
//!         "retryable": false
//!     }
//! }
//! ```

pub mod handlers;
pub mod routes;

pub use routes::configure_routes;
