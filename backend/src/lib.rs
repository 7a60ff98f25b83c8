//! # Coupon Issuance Backend
//!
//! Issues coupons against policies with a fixed quota, without ever
//! issuing more than the quota allows under concurrent load.
//!
//! ## Layers
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  api (actix-web)                                           │
//! ├────────────────────────────────────────────────────────────┤
//! │  services: IssuanceCoordinator · CouponLifecycle           │
//! │            IssueConsumer · QuotaReconciler                 │
//! ├──────────────┬──────────────┬──────────────┬───────────────┤
//! │  ledger      │  cache       │  lock        │  queue        │
//! │  (Postgres)  │  (Redis)     │  (Redis)     │  (mpsc/Kafka) │
//! └──────────────┴──────────────┴──────────────┴───────────────┘
//! ```
//!
//! Every store sits behind a trait with an in-memory implementation, so
//! the services and the HTTP layer run in tests without external servers.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod queue;
pub mod services;
pub mod utils;

use config::AppConfig;
use services::{Backends, CouponLifecycle, IssuanceCoordinator};

/// Application state shared across all handlers.
pub struct AppState {
    /// Stores behind the services, also probed by `/health`
    pub backends: Backends,

    /// Synchronous and queued issuance
    pub issuance: IssuanceCoordinator,

    /// Use, cancel and lookups
    pub lifecycle: CouponLifecycle,

    /// Application configuration
    pub config: AppConfig,
}
