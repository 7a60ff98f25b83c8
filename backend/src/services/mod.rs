//! # Services Module
//!
//! Business logic for coupon issuance and redemption.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `IssuanceCoordinator` | Admission under quota, sync and queued issue |
//! | `CouponLifecycle` | Use, cancel and lookups |
//! | `IssueConsumer` | Persists queued issue requests |
//! | `QuotaReconciler` | Pulls quota counters back in line with the ledger |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                           │
//! │                                                                 │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                  IssuanceCoordinator                     │   │
//! │  │  • issue_coupon()  • request_issue()                     │   │
//! │  │  • process_issue_message()                               │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │          │                   │                    │             │
//! │          ▼                   ▼                    ▼             │
//! │  ┌─────────────┐     ┌──────────────┐     ┌──────────────┐      │
//! │  │   Coupon    │     │    Issue     │     │    Quota     │      │
//! │  │  Lifecycle  │     │   Consumer   │     │  Reconciler  │      │
//! │  └─────────────┘     └──────────────┘     └──────────────┘      │
//! │                                                                 │
//! │         Backends: ledger · counter · lock · queue · clock       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod issuance;
pub mod issue_consumer;
pub mod lifecycle;
pub mod quota_reconciler;

use std::sync::Arc;

use crate::cache::{CouponStateCache, InMemoryCache, QuotaCounter};
use crate::ledger::{CouponLedger, InMemoryLedger};
use crate::lock::{DistributedLock, InMemoryLock};
use crate::queue::IssuePublisher;
use crate::utils::{Clock, SystemClock};

pub use issuance::{AdmissionStrategy, IssuanceCoordinator, IssuanceSettings, IssueAccepted};
pub use issue_consumer::IssueConsumer;
pub use lifecycle::CouponLifecycle;
pub use quota_reconciler::{QuotaReconciler, ReconcileOutcome, ReconcileSummary};

/// Every store the services talk to, behind its trait.
#[derive(Clone)]
pub struct Backends {
    pub ledger: Arc<dyn CouponLedger>,
    pub counter: Arc<dyn QuotaCounter>,
    pub state_cache: Arc<dyn CouponStateCache>,
    pub lock: Arc<dyn DistributedLock>,
    pub publisher: Arc<dyn IssuePublisher>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// In-process backends around the given ledger and publisher.
    pub fn in_memory(ledger: Arc<InMemoryLedger>, publisher: Arc<dyn IssuePublisher>) -> Self {
        let cache = Arc::new(InMemoryCache::new());
        Self {
            ledger,
            counter: cache.clone(),
            state_cache: cache,
            lock: Arc::new(InMemoryLock::new()),
            publisher,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
