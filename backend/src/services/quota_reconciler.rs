//! # Quota Reconciler
//!
//! Keeps quota counters in line with the ledger.
//!
//! The counter is a cache of `total_quantity - issued`. It can go stale:
//! - the cache was flushed or restarted
//! - a compensating increment was lost
//! - coupons were written by another process
//!
//! The ledger is always the **source of truth**.
//!
//! ## Reconciliation Flow
//!
//! ```text
//! Every N seconds:
//! 1. List policies whose issuance window covers now
//!               ↓
//! 2. For each policy, take the policy lock
//!               ↓
//! 3. Compare counter against total_quantity - issued
//!               ↓
//! 4. Missing  → seed it
//!    Higher   → lower it to the ledger value
//!    Lower    → log drift only (queued reservations not yet persisted)
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Backends;
use crate::db::CouponPolicy;
use crate::error::CouponError;
use crate::lock::{acquire_with_backoff, LockSettings};
use crate::utils::ttl_until;

/// What reconciling one policy did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Counter was absent and has been seeded.
    Seeded { remaining: i64 },
    /// Counter promised more than the ledger allows and was lowered.
    Lowered { from: i64, to: i64 },
    InSync { remaining: i64 },
    /// Counter is below the ledger value. Left alone.
    Drift { cached: i64, authoritative: i64 },
}

impl ReconcileOutcome {
    pub fn changed_counter(&self) -> bool {
        matches!(self, Self::Seeded { .. } | Self::Lowered { .. })
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seeded { remaining } => write!(f, "seeded at {}", remaining),
            Self::Lowered { from, to } => write!(f, "lowered from {} to {}", from, to),
            Self::InSync { remaining } => write!(f, "in sync at {}", remaining),
            Self::Drift { cached, authoritative } => {
                write!(f, "drift (cached {}, ledger {})", cached, authoritative)
            }
        }
    }
}

/// Totals from one full pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub corrected: usize,
    pub drifted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct QuotaReconciler {
    backends: Backends,
    lock_settings: LockSettings,
    interval: Duration,
}

impl QuotaReconciler {
    pub fn new(backends: Backends, lock_settings: LockSettings, interval: Duration) -> Self {
        Self {
            backends,
            lock_settings,
            interval,
        }
    }

    /// Run `reconcile_all_policies` every interval until `shutdown` fires.
    ///
    /// Spawn this as a background task.
    pub async fn start_reconciliation_loop(&self, shutdown: CancellationToken) {
        info!(
            "Starting quota reconciliation loop (interval: {}s)",
            self.interval.as_secs()
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            debug!("Running scheduled quota reconciliation...");
            if let Err(e) = self.reconcile_all_policies().await {
                error!("Quota reconciliation failed: {}", e);
            }
        }

        info!("Quota reconciliation loop stopped");
    }

    /// Reconcile every policy currently issuing.
    ///
    /// A failure on one policy is logged and counted; the pass continues.
    pub async fn reconcile_all_policies(&self) -> Result<ReconcileSummary, CouponError> {
        let policies = self
            .backends
            .ledger
            .list_active_policies(self.backends.clock.now())
            .await?;

        let mut summary = ReconcileSummary::default();
        for policy in &policies {
            summary.checked += 1;
            match self.reconcile_policy(policy).await {
                Ok(outcome) if outcome.changed_counter() => summary.corrected += 1,
                Ok(ReconcileOutcome::Drift { .. }) => summary.drifted += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to reconcile quota for {}: {}", policy.code, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Quota reconciliation complete: checked {} policies, corrected {}, drift {}, failed {}",
            summary.checked, summary.corrected, summary.drifted, summary.failed
        );
        Ok(summary)
    }

    /// Reconcile one policy under its lock.
    pub async fn reconcile_policy(&self, policy: &CouponPolicy) -> Result<ReconcileOutcome, CouponError> {
        let guard = acquire_with_backoff(self.backends.lock.as_ref(), &policy.code, &self.lock_settings).await?;
        let outcome = self.compare_and_fix(policy).await;
        guard.release(self.backends.lock.as_ref()).await;

        let outcome = outcome?;
        match outcome {
            ReconcileOutcome::Seeded { .. } | ReconcileOutcome::Lowered { .. } => {
                info!(coupon_policy_code = %policy.code, "Quota counter {}", outcome);
            }
            ReconcileOutcome::Drift { .. } => {
                warn!(coupon_policy_code = %policy.code, "Quota counter {}", outcome);
            }
            ReconcileOutcome::InSync { .. } => {
                debug!(coupon_policy_code = %policy.code, "Quota counter {}", outcome);
            }
        }
        Ok(outcome)
    }

    async fn compare_and_fix(&self, policy: &CouponPolicy) -> Result<ReconcileOutcome, CouponError> {
        let issued = self.backends.ledger.count_issued(policy.id).await?;
        let authoritative = policy.remaining_after(issued);
        let ttl = ttl_until(policy.end_time, self.backends.clock.now());

        match self.backends.counter.get(&policy.code).await? {
            None => {
                self.backends.counter.seed(&policy.code, authoritative, ttl).await?;
                Ok(ReconcileOutcome::Seeded { remaining: authoritative })
            }
            Some(cached) if cached > authoritative => {
                self.backends.counter.set(&policy.code, authoritative, ttl).await?;
                Ok(ReconcileOutcome::Lowered {
                    from: cached,
                    to: authoritative,
                })
            }
            Some(cached) if cached < authoritative => Ok(ReconcileOutcome::Drift { cached, authoritative }),
            Some(cached) => Ok(ReconcileOutcome::InSync { remaining: cached }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};

    use crate::db::Coupon;
    use crate::ledger::memory::fixtures::open_policy;
    use crate::ledger::{CouponLedger, InMemoryLedger};
    use crate::lock::lock_key;
    use crate::queue::ChannelQueue;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fast_lock() -> LockSettings {
        LockSettings {
            ttl: Duration::from_secs(1),
            wait: Duration::from_millis(50),
            retry_min: Duration::from_millis(5),
            retry_max: Duration::from_millis(10),
        }
    }

    async fn setup(quantity: i32, issued: usize) -> (QuotaReconciler, Backends, CouponPolicy, Arc<InMemoryLedger>) {
        let now = Utc::now();
        let ledger = Arc::new(InMemoryLedger::new(true));
        let policy = open_policy("SUMMER10", quantity, now);
        ledger.add_policy(policy.clone()).await;
        for i in 0..issued {
            ledger
                .insert_coupon(&Coupon::issue(policy.id, &format!("user-{}", i), now))
                .await
                .unwrap();
        }

        let (queue, _) = ChannelQueue::new(1, 1);
        let backends = Backends::in_memory(ledger.clone(), Arc::new(queue));
        let reconciler = QuotaReconciler::new(backends.clone(), fast_lock(), Duration::from_secs(60));
        (reconciler, backends, policy, ledger)
    }

    #[tokio::test]
    async fn test_missing_counter_is_seeded_from_ledger() {
        let (reconciler, backends, policy, _) = setup(10, 4).await;

        let outcome = reconciler.reconcile_policy(&policy).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Seeded { remaining: 6 });
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_generous_counter_is_lowered() {
        let (reconciler, backends, policy, _) = setup(10, 4).await;
        backends.counter.set("SUMMER10", 9, HOUR).await.unwrap();

        let outcome = reconciler.reconcile_policy(&policy).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Lowered { from: 9, to: 6 });
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_lower_counter_is_left_alone() {
        let (reconciler, backends, policy, _) = setup(10, 4).await;
        backends.counter.set("SUMMER10", 5, HOUR).await.unwrap();

        let outcome = reconciler.reconcile_policy(&policy).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Drift {
                cached: 5,
                authoritative: 6
            }
        );
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_matching_counter_is_in_sync() {
        let (reconciler, backends, policy, _) = setup(3, 3).await;
        backends.counter.set("SUMMER10", 0, HOUR).await.unwrap();

        let outcome = reconciler.reconcile_policy(&policy).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::InSync { remaining: 0 });
        assert!(!outcome.changed_counter());
    }

    #[tokio::test]
    async fn test_held_lock_fails_the_policy() {
        let (reconciler, backends, policy, _) = setup(3, 0).await;
        backends
            .lock
            .try_acquire(&lock_key("SUMMER10"), "someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        let err = reconciler.reconcile_policy(&policy).await.unwrap_err();
        assert!(matches!(err, CouponError::TooManyRequests(_)));
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_pass_skips_closed_policies() {
        let (reconciler, backends, _, ledger) = setup(5, 1).await;
        let mut closed = open_policy("EXPIRED", 5, Utc::now());
        closed.end_time = Utc::now() - ChronoDuration::minutes(1);
        closed.start_time = closed.end_time - ChronoDuration::hours(1);
        ledger.add_policy(closed).await;

        let summary = reconciler.reconcile_all_policies().await.unwrap();
        assert_eq!(
            summary,
            ReconcileSummary {
                checked: 1,
                corrected: 1,
                drifted: 0,
                failed: 0
            }
        );
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), Some(4));
        assert_eq!(backends.counter.get("EXPIRED").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_until_cancelled() {
        let (reconciler, backends, _, _) = setup(5, 0).await;
        let shutdown = CancellationToken::new();

        let task = {
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.start_reconciliation_loop(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backends.counter.get("SUMMER10").await.unwrap(), Some(5));

        shutdown.cancel();
        task.await.unwrap();
    }
}
